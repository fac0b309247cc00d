//! Error types for egress-gate.

use thiserror::Error;

/// Error type for egress-gate operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or invalid rule configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A domain could not be resolved to any address
    #[error("failed to resolve {domain}: {reason}")]
    Resolution { domain: String, reason: String },

    /// Wildcard domains cannot be reduced to a finite address set
    #[error("wildcard domain {0} cannot be pre-resolved")]
    WildcardDomain(String),

    /// Port entry is not a decimal port or range
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// Port range whose lower bound exceeds its upper bound
    #[error("invalid port range {0}: start > end")]
    InvalidPortRange(String),

    /// Address entry is neither an IPv4 address nor an IPv4 CIDR
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// The kernel rejected a transaction
    #[error("nftables transaction failed: {0}")]
    Kernel(String),

    /// No address set has been compiled for the given rule name
    #[error("no address set found for rule {0}")]
    SetNotFound(String),

    /// Operation not allowed in the current lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// File watcher error
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl Error {
    /// Build a resolution error for a domain.
    pub fn resolution(domain: &str, reason: impl Into<String>) -> Self {
        Error::Resolution {
            domain: domain.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for egress-gate operations.
pub type Result<T> = std::result::Result<T, Error>;
