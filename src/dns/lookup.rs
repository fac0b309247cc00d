//! Address lookups against upstream DNS servers and the host resolver.

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig as UpstreamConfig, ResolverOpts};
use hickory_resolver::Resolver as UpstreamResolver;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::{Error, Result};

/// A source of IPv4 addresses for a domain name.
///
/// An empty answer is not an error; callers decide whether to try the next source.
pub trait Lookup: Send + Sync {
    /// Human readable name used in logs.
    fn name(&self) -> &str;

    /// Resolve a domain to its IPv4 addresses.
    fn lookup_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>>;
}

/// Queries a single recursive DNS server for A records.
pub struct DnsUpstream {
    name: String,
    resolver: UpstreamResolver,
}

impl DnsUpstream {
    /// Create a lookup bound to one server. Queries go over UDP with TCP
    /// fallback, one attempt each, bounded by `timeout`.
    pub fn new(server: SocketAddr, timeout: Duration) -> Result<Self> {
        let group = NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true);
        let config = UpstreamConfig::from_parts(None, vec![], group);

        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        opts.use_hosts_file = false;

        let resolver = UpstreamResolver::new(config, opts)?;
        Ok(Self {
            name: server.to_string(),
            resolver,
        })
    }
}

impl Lookup for DnsUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookup_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        let fqdn = format!("{}.", domain.trim_end_matches('.'));
        let answer = self
            .resolver
            .lookup_ip(fqdn.as_str())
            .map_err(|e| Error::resolution(domain, e.to_string()))?;

        Ok(dedup_v4(answer.iter()))
    }
}

/// The host platform resolver (`getaddrinfo`), used as last resort.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

impl Lookup for SystemLookup {
    fn name(&self) -> &str {
        "system"
    }

    fn lookup_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        let addrs = (domain, 0u16)
            .to_socket_addrs()
            .map_err(|e| Error::resolution(domain, e.to_string()))?;

        Ok(dedup_v4(addrs.map(|addr| addr.ip())))
    }
}

/// Keep the IPv4 addresses of an answer, first occurrence wins.
fn dedup_v4(addrs: impl Iterator<Item = IpAddr>) -> Vec<Ipv4Addr> {
    let mut out: Vec<Ipv4Addr> = Vec::new();
    for addr in addrs {
        if let IpAddr::V4(v4) = addr {
            if !out.contains(&v4) {
                out.push(v4);
            }
        }
    }
    out
}
