//! Compilation of egress rules into nftables objects.
//!
//! The compiler owns one table laid out as:
//!
//! ```text
//! table ip <table>
//!   chain forward      (filter, hook forward, policy drop)
//!     jump egress_rules
//!     drop             <- always the last instruction
//!   chain egress_rules
//!     <compiled rules, in the order they were added>
//!   chain postrouting  (nat, hook postrouting)
//!     masquerade
//!   set ips_<n>        (one per address-bearing rule)
//! ```
//!
//! Compiled rules are appended to `egress_rules`, never to `forward`, so any
//! packet that no rule accepts or drops falls through to the terminal drop.

mod address;

pub use address::{parse_address, parse_addresses};

use ahash::AHashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::netfilter::{
    BaseChain, Batch, Chain, ChainType, Hook, Netfilter, Policy, Statement,
};
use crate::port::PortSpec;
use crate::{Action, Protocol};

/// Default name of the owned table.
pub const DEFAULT_TABLE: &str = "egress_gate";

/// Base chain on the forward hook.
pub const FORWARD_CHAIN: &str = "forward";

/// Regular chain holding the compiled rules.
pub const RULES_CHAIN: &str = "egress_rules";

/// NAT chain on the postrouting hook.
pub const NAT_CHAIN: &str = "postrouting";

/// Kernel limit on object name length, including the terminator.
const MAX_NAME_LEN: usize = 255;

/// Source NAT priority (`srcnat`).
const NAT_PRIORITY: i32 = 100;

/// Identifies the address set of a compiled rule.
///
/// Domain sub-rules live in their own key space, so no rule name can alias
/// the set of another rule's domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetKey {
    rule: String,
    domain: Option<String>,
}

impl SetKey {
    /// Key of a rule's literal addresses.
    pub fn rule(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            domain: None,
        }
    }

    /// Key of the addresses resolved for one domain of a rule.
    pub fn domain(rule: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            domain: Some(domain.into()),
        }
    }

    pub fn rule_name(&self) -> &str {
        &self.rule
    }

    pub fn domain_name(&self) -> Option<&str> {
        self.domain.as_deref()
    }
}

impl fmt::Display for SetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.domain {
            Some(domain) => write!(f, "{}[{}]", self.rule, domain),
            None => write!(f, "{}", self.rule),
        }
    }
}

/// Abstract rule handed to [`Compiler::add_rule`].
#[derive(Debug, Clone)]
pub struct RuleSpec<'a> {
    /// Identifies the address set; unique per compiled sub-rule
    pub key: SetKey,
    pub action: Action,
    /// Informational; instruction order follows call order
    pub priority: i64,
    /// IPv4 addresses or CIDRs; empty means any destination
    pub addresses: &'a [String],
    /// Port entries; empty means any port
    pub ports: &'a [String],
    /// Protocols; empty means any protocol
    pub protocols: &'a [Protocol],
}

/// Owns the kernel filtering objects of one table.
pub struct Compiler {
    netfilter: Arc<dyn Netfilter>,
    table: String,
    sets: RwLock<AHashMap<SetKey, String>>,
    next_set: AtomicUsize,
}

impl Compiler {
    /// Create a compiler managing the default table.
    pub fn new(netfilter: Arc<dyn Netfilter>) -> Self {
        Self::with_table(netfilter, DEFAULT_TABLE)
    }

    /// Create a compiler managing a named table.
    pub fn with_table(netfilter: Arc<dyn Netfilter>, table: impl Into<String>) -> Self {
        Self {
            netfilter,
            table: table.into(),
            sets: RwLock::new(AHashMap::new()),
            next_set: AtomicUsize::new(0),
        }
    }

    /// Name of the owned table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Kernel set name backing a rule, if one was compiled.
    pub fn set_name(&self, key: &SetKey) -> Option<String> {
        self.sets.read().get(key).cloned()
    }

    /// Number of address sets currently owned.
    pub fn set_count(&self) -> usize {
        self.sets.read().len()
    }

    /// Create the table, chains, terminal drop and masquerade in one transaction.
    pub fn setup(&self) -> Result<()> {
        let mut batch = self.batch();
        self.push_setup(&mut batch);
        self.netfilter.commit(&batch)?;
        self.forget_sets();

        log::info!(
            "Created nftables table '{}' with forward chain and NAT",
            self.table
        );
        Ok(())
    }

    /// Delete the table and everything in it.
    ///
    /// Succeeds whether or not [`setup`](Self::setup) ever ran.
    pub fn cleanup(&self) -> Result<()> {
        let mut batch = self.batch();
        self.push_teardown(&mut batch);
        self.netfilter.commit(&batch)?;
        self.forget_sets();

        log::info!("Removed nftables table '{}'", self.table);
        Ok(())
    }

    /// Tear down and set up again in a single transaction.
    ///
    /// The forward hook is never without its terminal drop, so traffic seen
    /// before rules are re-added is dropped.
    pub fn reset(&self) -> Result<()> {
        let mut batch = self.batch();
        self.push_teardown(&mut batch);
        self.push_setup(&mut batch);
        self.netfilter.commit(&batch)?;
        self.forget_sets();

        log::info!("Reset nftables table '{}' to drop-only", self.table);
        Ok(())
    }

    /// Compile a rule and append it in one transaction.
    ///
    /// Each (protocol, port) combination becomes its own kernel rule. Malformed
    /// addresses and ports are logged and skipped. Returns the number of kernel
    /// rules appended.
    pub fn add_rule(&self, spec: &RuleSpec<'_>) -> Result<usize> {
        let label = spec.key.to_string();
        let ports = parse_ports(&label, spec.ports);
        if !spec.ports.is_empty() && ports.is_empty() {
            log::warn!("Rule {} has no valid port entries; not compiling it", label);
            return Ok(0);
        }

        let mut batch = self.batch();

        let mut new_set = None;
        let set = if spec.addresses.is_empty() {
            None
        } else {
            let set = match self.set_name(&spec.key) {
                Some(existing) => existing,
                None => {
                    let allocated = self.allocate_set_name(&spec.key);
                    batch.add_set(allocated.clone());
                    new_set = Some(allocated.clone());
                    allocated
                }
            };
            batch.add_elements(set.clone(), parse_addresses(&label, spec.addresses));
            Some(set)
        };

        let comment = format!("{} (order {})", label, spec.priority);
        let mut compiled = 0;
        for statements in expand(spec, set.as_deref(), &ports) {
            batch.add_rule(RULES_CHAIN, statements, Some(comment.clone()));
            compiled += 1;
        }

        self.netfilter.commit(&batch)?;

        if let Some(set) = new_set {
            self.sets.write().insert(spec.key.clone(), set);
        }

        log::debug!(
            "Compiled rule {} ({}) into {} nftables rules",
            label,
            spec.action,
            compiled
        );
        Ok(compiled)
    }

    /// Replace the members of a rule's address set in one transaction.
    ///
    /// Fails with [`Error::SetNotFound`] if the rule never had an address set.
    pub fn update_ips<S: AsRef<str>>(&self, key: &SetKey, addresses: &[S]) -> Result<()> {
        let label = key.to_string();
        let set = self
            .set_name(key)
            .ok_or_else(|| Error::SetNotFound(label.clone()))?;

        let mut batch = self.batch();
        batch
            .flush_set(set.clone())
            .add_elements(set, parse_addresses(&label, addresses));
        self.netfilter.commit(&batch)?;

        log::debug!("Updated address set for {}", label);
        Ok(())
    }

    fn batch(&self) -> Batch {
        Batch::new(self.table.clone())
    }

    /// Declaring the table first makes the delete valid even if it is absent.
    fn push_teardown(&self, batch: &mut Batch) {
        batch.add_table().delete_table();
    }

    fn push_setup(&self, batch: &mut Batch) {
        batch
            .add_table()
            .add_chain(Chain::regular(RULES_CHAIN))
            .add_chain(Chain::base(
                FORWARD_CHAIN,
                BaseChain {
                    chain_type: ChainType::Filter,
                    hook: Hook::Forward,
                    priority: 0,
                    policy: Policy::Drop,
                },
            ))
            .add_rule(
                FORWARD_CHAIN,
                vec![Statement::Jump(RULES_CHAIN.to_string())],
                None,
            )
            .add_rule(
                FORWARD_CHAIN,
                vec![Statement::Drop],
                Some("default deny".to_string()),
            )
            .add_chain(Chain::base(
                NAT_CHAIN,
                BaseChain {
                    chain_type: ChainType::Nat,
                    hook: Hook::Postrouting,
                    priority: NAT_PRIORITY,
                    policy: Policy::Accept,
                },
            ))
            .add_rule(NAT_CHAIN, vec![Statement::Masquerade], None);
    }

    fn forget_sets(&self) {
        self.sets.write().clear();
        self.next_set.store(0, Ordering::SeqCst);
    }

    /// Set names are numbered so distinct rule names never collide after sanitizing.
    fn allocate_set_name(&self, key: &SetKey) -> String {
        let id = self.next_set.fetch_add(1, Ordering::SeqCst);
        let mut name = format!("ips_{}_{}", id, sanitize_name(&key.to_string()));
        name.truncate(MAX_NAME_LEN);
        name
    }
}

/// Replace characters nftables does not accept in object names.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn parse_ports(rule: &str, entries: &[String]) -> Vec<PortSpec> {
    let mut ports = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.parse::<PortSpec>() {
            Ok(port) => ports.push(port),
            Err(e) => log::warn!("Skipping port in rule {}: {}", rule, e),
        }
    }
    ports
}

/// Build one statement list per (protocol, port) combination.
///
/// Field order is fixed: protocol, destination set, destination port, verdict.
fn expand(spec: &RuleSpec<'_>, set: Option<&str>, ports: &[PortSpec]) -> Vec<Vec<Statement>> {
    let protocols: Vec<Option<Protocol>> = if spec.protocols.is_empty() {
        vec![None]
    } else {
        spec.protocols.iter().copied().map(Some).collect()
    };
    let all_ports: Vec<Option<PortSpec>> = if ports.is_empty() {
        vec![None]
    } else {
        ports.iter().copied().map(Some).collect()
    };

    let verdict = match spec.action {
        Action::Allow => Statement::Accept,
        Action::Deny => Statement::Drop,
    };

    let mut out = Vec::new();
    for protocol in protocols {
        let port_choices: &[Option<PortSpec>] = match protocol {
            Some(p) if !p.has_ports() => &[None],
            _ => &all_ports,
        };

        for port in port_choices {
            let mut statements = Vec::with_capacity(4);
            if let Some(protocol) = protocol {
                statements.push(Statement::Protocol(protocol));
            }
            if let Some(set) = set {
                statements.push(Statement::DestinationInSet(set.to_string()));
            }
            if let Some(port) = port {
                statements.push(Statement::DestinationPort(*port));
            }
            statements.push(verdict.clone());
            out.push(statements);
        }
    }
    out
}
