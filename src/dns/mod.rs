//! Domain resolution with a TTL cache and background refresh.
//!
//! Resolved domains are cached for a fixed TTL regardless of the record TTL
//! served upstream. A background refresh pass re-resolves every cached domain
//! on a timer and reports each result, changed or not, to a callback.

mod lookup;

pub use lookup::{DnsUpstream, Lookup, SystemLookup};

use ahash::AHashMap;
use crossbeam_channel::{select, tick, Receiver};
use parking_lot::RwLock;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::wildcard::is_wildcard;

/// Default lifetime of a cache entry.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Default interval between background refresh passes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default per-query timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the [`Resolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Upstream servers, queried in order
    pub servers: Vec<SocketAddr>,
    /// Timeout for a single upstream query
    pub timeout: Duration,
    /// How long a successful answer is served from cache
    pub cache_ttl: Duration,
    /// How often cached domains are re-resolved
    pub refresh_interval: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                SocketAddr::from(([8, 8, 8, 8], 53)),
                SocketAddr::from(([1, 1, 1, 1], 53)),
            ],
            timeout: DEFAULT_QUERY_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    addresses: Vec<Ipv4Addr>,
    expires_at: Instant,
}

/// Caching resolver over an ordered list of upstream lookups.
pub struct Resolver {
    upstreams: Vec<Box<dyn Lookup>>,
    fallback: Box<dyn Lookup>,
    cache: RwLock<AHashMap<String, CacheEntry>>,
    cache_ttl: Duration,
    refresh_interval: Duration,
}

impl Resolver {
    /// Create a resolver querying the configured servers, then the host resolver.
    pub fn new(config: &ResolverConfig) -> Result<Self> {
        let mut upstreams: Vec<Box<dyn Lookup>> = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            upstreams.push(Box::new(DnsUpstream::new(*server, config.timeout)?));
        }
        Ok(Self::with_lookups(upstreams, Box::new(SystemLookup), config))
    }

    /// Create a resolver from explicit lookups.
    pub fn with_lookups(
        upstreams: Vec<Box<dyn Lookup>>,
        fallback: Box<dyn Lookup>,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            upstreams,
            fallback,
            cache: RwLock::new(AHashMap::new()),
            cache_ttl: config.cache_ttl,
            refresh_interval: config.refresh_interval,
        }
    }

    /// Resolve a domain to IPv4 addresses, serving from cache while fresh.
    ///
    /// Wildcard patterns fail with [`Error::WildcardDomain`].
    pub fn resolve(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        if is_wildcard(domain) {
            return Err(Error::WildcardDomain(domain.to_string()));
        }

        if let Some(entry) = self.cache.read().get(domain) {
            if Instant::now() < entry.expires_at {
                return Ok(entry.addresses.clone());
            }
        }

        let addresses = self.lookup(domain)?;
        self.store(domain, &addresses);
        Ok(addresses)
    }

    /// Query upstreams in order; the first non-empty answer wins.
    fn lookup(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        for upstream in &self.upstreams {
            match upstream.lookup_ipv4(domain) {
                Ok(addresses) if !addresses.is_empty() => {
                    log::debug!(
                        "Resolved {} via {}: {:?}",
                        domain,
                        upstream.name(),
                        addresses
                    );
                    return Ok(addresses);
                }
                Ok(_) => log::debug!("No A records for {} from {}", domain, upstream.name()),
                Err(e) => log::debug!("DNS query to {} failed: {}", upstream.name(), e),
            }
        }

        let addresses = self.fallback.lookup_ipv4(domain)?;
        if addresses.is_empty() {
            return Err(Error::resolution(domain, "no IPv4 addresses found"));
        }
        log::debug!(
            "Resolved {} via {} fallback: {:?}",
            domain,
            self.fallback.name(),
            addresses
        );
        Ok(addresses)
    }

    fn store(&self, domain: &str, addresses: &[Ipv4Addr]) {
        let entry = CacheEntry {
            addresses: addresses.to_vec(),
            expires_at: Instant::now() + self.cache_ttl,
        };
        self.cache.write().insert(domain.to_string(), entry);
    }

    /// Get the cached addresses for a domain, fresh or stale.
    pub fn cached(&self, domain: &str) -> Option<Vec<Ipv4Addr>> {
        self.cache.read().get(domain).map(|e| e.addresses.clone())
    }

    /// Number of cached domains.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop cached domains for which `keep` returns false, so later refresh
    /// passes no longer query them. Returns the number removed.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|domain, _| keep(domain));
        before - cache.len()
    }

    /// Re-resolve every cached domain once.
    ///
    /// `on_refresh` is called for each domain that resolved, whether or not its
    /// addresses changed. Domains that fail keep their previous entry.
    /// Returns the number of domains refreshed.
    pub fn refresh_now<F>(&self, mut on_refresh: F) -> usize
    where
        F: FnMut(&str, &[Ipv4Addr]),
    {
        let domains: Vec<String> = self.cache.read().keys().cloned().collect();

        let mut refreshed = 0;
        for domain in domains {
            let addresses = match self.lookup(&domain) {
                Ok(addresses) => addresses,
                Err(e) => {
                    log::warn!("Failed to refresh DNS for {}: {}", domain, e);
                    continue;
                }
            };

            self.store(&domain, &addresses);
            on_refresh(&domain, &addresses);
            refreshed += 1;
        }
        refreshed
    }

    /// Run refresh passes every `refresh_interval` until `cancel` fires or
    /// its sender is dropped. A pass in progress always runs to completion.
    pub fn run_periodic_refresh<F>(&self, cancel: &Receiver<()>, mut on_refresh: F)
    where
        F: FnMut(&str, &[Ipv4Addr]),
    {
        let ticker = tick(self.refresh_interval);
        loop {
            select! {
                recv(ticker) -> _ => {
                    let refreshed = self.refresh_now(&mut on_refresh);
                    log::debug!("DNS refresh pass updated {} domains", refreshed);
                }
                recv(cancel) -> _ => {
                    log::debug!("DNS refresh stopped");
                    return;
                }
            }
        }
    }
}
