//! Address entry parsing for set elements.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::error::Error;

/// Parse an IPv4 address or CIDR into a network.
///
/// CIDR entries keep their full prefix and are normalized to the network
/// address (`10.1.2.3/8` becomes `10.0.0.0/8`). Plain addresses become `/32`.
pub fn parse_address(entry: &str) -> Result<Ipv4Net, Error> {
    let entry = entry.trim();

    if let Ok(net) = entry.parse::<Ipv4Net>() {
        return Ok(net.trunc());
    }

    entry
        .parse::<Ipv4Addr>()
        .map(Ipv4Net::from)
        .map_err(|_| Error::InvalidAddress(entry.to_string()))
}

/// Parse address entries, logging and skipping malformed ones.
///
/// The result is aggregated so overlapping or adjacent networks collapse
/// into the smallest equivalent list, as interval sets require.
pub fn parse_addresses<S: AsRef<str>>(rule: &str, entries: &[S]) -> Vec<Ipv4Net> {
    let mut nets = Vec::with_capacity(entries.len());
    for entry in entries {
        match parse_address(entry.as_ref()) {
            Ok(net) => nets.push(net),
            Err(e) => log::warn!("Skipping address in rule {}: {}", rule, e),
        }
    }
    Ipv4Net::aggregate(&nets)
}
