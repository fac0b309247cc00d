//! egress-gate - Egress filtering for a Linux forwarding gateway.
//!
//! This crate turns a declarative list of egress rules into nftables state on
//! the gateway and keeps that state current as DNS answers and the rule file
//! change.
//!
//! # Features
//!
//! - **Fail closed**: the forward hook always ends in a drop; traffic that no
//!   rule allows never leaves
//! - **Domain rules**: domains are resolved per rule and kept fresh by a
//!   background DNS refresh that rewrites the address sets in place
//! - **Address and port rules**: IPv4 addresses, CIDR ranges, single ports and
//!   port ranges for TCP, UDP and ICMP
//! - **Hot reload**: the rule file is watched and reapplied atomically; an
//!   invalid file leaves the running rules untouched
//! - **Atomic kernel updates**: every change is one nftables transaction
//!
//! # Quick Start
//!
//! ```ignore
//! use egress_gate::{Config, Filter, Settings};
//!
//! let config = Config::load("/etc/egress-gate/config.yaml")?;
//! let filter = Filter::from_settings(config, "/etc/egress-gate/config.yaml", &Settings::default())?;
//!
//! filter.start()?;
//! // ... serve traffic ...
//! filter.stop()?;
//! ```
//!
//! # Rule Evaluation
//!
//! Rules are applied in ascending `order`. The first rule matching a packet
//! decides its verdict; packets matching no rule are dropped.

mod action;
mod error;
mod protocol;

pub mod compiler;
pub mod config;
pub mod dns;
pub mod filter;
pub mod netfilter;
pub mod port;
pub mod wildcard;

// Re-export core types
pub use action::Action;
pub use error::{Error, Result};
pub use protocol::Protocol;

// Re-export configuration types
pub use config::{Config, ConfigFormat, Egress, Rule, Settings};

// Re-export the main components
pub use compiler::{Compiler, RuleSpec, SetKey};
pub use dns::{Resolver, ResolverConfig};
pub use filter::{Filter, Lifecycle, RuleKind};
pub use netfilter::{MemoryNetfilter, Netfilter, NftCommand};
pub use port::PortSpec;
