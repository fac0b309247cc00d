//! Destination port specifications.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A single destination port or an inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
}

impl PortSpec {
    /// Check whether a port falls within this specification.
    pub fn contains(&self, port: u16) -> bool {
        match *self {
            PortSpec::Single(p) => p == port,
            PortSpec::Range(low, high) => (low..=high).contains(&port),
        }
    }
}

impl FromStr for PortSpec {
    type Err = Error;

    /// Parse `"443"` or `"8000-9000"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| Error::InvalidPort(s.to_string()))
        };

        match s.split_once('-') {
            Some((low, high)) => {
                let (low, high) = (parse(low)?, parse(high)?);
                if low > high {
                    return Err(Error::InvalidPortRange(s.to_string()));
                }
                Ok(PortSpec::Range(low, high))
            }
            None => Ok(PortSpec::Single(parse(s)?)),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(p) => write!(f, "{}", p),
            PortSpec::Range(low, high) => write!(f, "{}-{}", low, high),
        }
    }
}
