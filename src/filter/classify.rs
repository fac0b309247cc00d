//! Rule classification.

use crate::config::Rule;
use crate::wildcard::{is_wildcard, matches};

/// How a rule is turned into kernel rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind<'a> {
    /// The rule names domains. Each resolvable domain becomes its own
    /// sub-rule; wildcard patterns only take part in update matching.
    Domain {
        resolvable: Vec<&'a str>,
        wildcards: Vec<&'a str>,
    },
    /// Literal addresses only.
    Address,
    /// No destination criteria; protocol and port matches only.
    ProtocolOnly,
}

impl RuleKind<'_> {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Domain { .. } => "domain",
            RuleKind::Address => "address",
            RuleKind::ProtocolOnly => "protocol-only",
        }
    }
}

/// Classify a rule by its destination criteria.
pub fn classify(rule: &Rule) -> RuleKind<'_> {
    let egress = &rule.egress;
    if !egress.domains.is_empty() {
        let (wildcards, resolvable) = egress
            .domains
            .iter()
            .map(String::as_str)
            .partition(|d| is_wildcard(d));
        return RuleKind::Domain {
            resolvable,
            wildcards,
        };
    }
    if !egress.ips.is_empty() {
        return RuleKind::Address;
    }
    RuleKind::ProtocolOnly
}

/// Whether any domain pattern of the rule matches `domain`.
pub fn rule_matches_domain(rule: &Rule, domain: &str) -> bool {
    rule.egress.domains.iter().any(|p| matches(p, domain))
}
