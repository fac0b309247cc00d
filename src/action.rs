//! Verdict actions attached to egress rules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Action represents what happens to traffic matching a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Let the packet through
    Allow,
    /// Drop the packet
    Deny,
}

impl Action {
    /// Get the configuration string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
