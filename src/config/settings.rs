//! Runtime settings for the gateway.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::compiler::DEFAULT_TABLE;
use crate::dns::ResolverConfig;

/// Settings that are not part of the rule configuration itself.
#[derive(Debug, Clone)]
pub struct Settings {
    /// DNS resolution settings
    pub resolver: ResolverConfig,
    /// Path to the `nft` binary
    pub nft_path: PathBuf,
    /// Name of the nftables table owned by the gateway
    pub table: String,
    /// Whether to hot-reload the rule configuration on change
    pub watch: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resolver: ResolverConfig::default(),
            nft_path: PathBuf::from("nft"),
            table: DEFAULT_TABLE.to_string(),
            watch: true,
        }
    }
}

impl Settings {
    /// Replace the upstream DNS servers, keeping their order.
    pub fn with_servers(mut self, servers: Vec<SocketAddr>) -> Self {
        self.resolver.servers = servers;
        self
    }

    /// Set the DNS cache TTL and the background refresh interval.
    pub fn with_dns_intervals(mut self, cache_ttl: Duration, refresh_interval: Duration) -> Self {
        self.resolver.cache_ttl = cache_ttl;
        self.resolver.refresh_interval = refresh_interval;
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_nft_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.nft_path = path.into();
        self
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }
}
