//! In-process model of the kernel filtering state.
//!
//! `MemoryNetfilter` applies batches with the same all-or-nothing semantics as
//! the kernel and rejects commands referencing missing tables, chains or sets.
//! It can also evaluate a packet against the forward hook, which makes the
//! resulting verdict observable without touching the host firewall.
//!
//! Sets behave like interval sets without auto-merge: re-adding an existing
//! element is accepted, adding one that overlaps a different element fails.

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use super::{BaseChain, Batch, Command, Hook, Netfilter, Policy, Rule, Statement};
use crate::error::{Error, Result};
use crate::Protocol;

/// Maximum jump depth, as enforced by the kernel.
const MAX_JUMP_DEPTH: usize = 16;

/// State of a single chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainState {
    pub base: Option<BaseChain>,
    pub rules: Vec<Rule>,
}

/// State of a single table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableState {
    pub chains: BTreeMap<String, ChainState>,
    pub sets: BTreeMap<String, Vec<Ipv4Net>>,
}

/// Snapshot of every table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ruleset {
    pub tables: BTreeMap<String, TableState>,
}

/// Packet header fields relevant to egress rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub destination: Ipv4Addr,
    pub protocol: Protocol,
    pub port: Option<u16>,
}

impl Packet {
    pub fn tcp(destination: Ipv4Addr, port: u16) -> Self {
        Self {
            destination,
            protocol: Protocol::Tcp,
            port: Some(port),
        }
    }

    pub fn udp(destination: Ipv4Addr, port: u16) -> Self {
        Self {
            destination,
            protocol: Protocol::Udp,
            port: Some(port),
        }
    }

    pub fn icmp(destination: Ipv4Addr) -> Self {
        Self {
            destination,
            protocol: Protocol::Icmp,
            port: None,
        }
    }
}

/// Final verdict for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

enum Outcome {
    Continue,
    Verdict(Verdict),
    Jump(String),
}

fn missing(kind: &str, name: &str) -> Error {
    Error::Kernel(format!("No such file or directory: {} {}", kind, name))
}

impl Ruleset {
    /// Apply a batch in place. Callers apply to a copy to get atomicity.
    fn apply(&mut self, batch: &Batch) -> Result<()> {
        let name = batch.table();
        for command in batch.commands() {
            match command {
                Command::AddTable => {
                    self.tables.entry(name.to_string()).or_default();
                }
                Command::DeleteTable => {
                    self.tables
                        .remove(name)
                        .ok_or_else(|| missing("table", name))?;
                }
                Command::AddChain(chain) => {
                    let table = self.table_mut(name)?;
                    table
                        .chains
                        .entry(chain.name.clone())
                        .or_insert_with(|| ChainState {
                            base: chain.base,
                            rules: Vec::new(),
                        });
                }
                Command::AddSet(set) => {
                    self.table_mut(name)?.sets.entry(set.clone()).or_default();
                }
                Command::FlushSet(set) => {
                    self.set_mut(name, set)?.clear();
                }
                Command::AddElements { set, elements } => {
                    let members = self.set_mut(name, set)?;
                    for net in elements {
                        if members.contains(net) {
                            continue;
                        }
                        if let Some(existing) = members.iter().find(|m| overlaps(m, net)) {
                            return Err(Error::Kernel(format!(
                                "conflicting intervals specified: {} overlaps {} in set {}",
                                net, existing, set
                            )));
                        }
                        members.push(*net);
                    }
                }
                Command::AddRule(rule) => {
                    let table = self.table_mut(name)?;
                    for statement in &rule.statements {
                        match statement {
                            Statement::DestinationInSet(set) if !table.sets.contains_key(set) => {
                                return Err(missing("set", set));
                            }
                            Statement::Jump(target) if !table.chains.contains_key(target) => {
                                return Err(missing("chain", target));
                            }
                            _ => {}
                        }
                    }
                    table
                        .chains
                        .get_mut(&rule.chain)
                        .ok_or_else(|| missing("chain", &rule.chain))?
                        .rules
                        .push(rule.clone());
                }
            }
        }
        Ok(())
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableState> {
        self.tables.get_mut(name).ok_or_else(|| missing("table", name))
    }

    fn set_mut(&mut self, table: &str, set: &str) -> Result<&mut Vec<Ipv4Net>> {
        self.table_mut(table)?
            .sets
            .get_mut(set)
            .ok_or_else(|| missing("set", set))
    }

    /// Evaluate a packet traversing the forward hook.
    ///
    /// With no base chain on the hook the kernel lets the packet through.
    pub fn evaluate(&self, packet: &Packet) -> Verdict {
        let mut hooked: Vec<(&TableState, &ChainState)> = self
            .tables
            .values()
            .flat_map(|table| table.chains.values().map(move |chain| (table, chain)))
            .filter(|(_, chain)| matches!(chain.base, Some(b) if b.hook == Hook::Forward))
            .collect();
        hooked.sort_by_key(|(_, chain)| chain.base.map(|b| b.priority));

        for (table, chain) in hooked {
            let verdict = run_chain(table, chain, packet, 0).unwrap_or(
                match chain.base.map(|b| b.policy) {
                    Some(Policy::Drop) => Verdict::Drop,
                    _ => Verdict::Accept,
                },
            );
            if verdict == Verdict::Drop {
                return Verdict::Drop;
            }
        }
        Verdict::Accept
    }
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

fn run_chain(
    table: &TableState,
    chain: &ChainState,
    packet: &Packet,
    depth: usize,
) -> Option<Verdict> {
    if depth > MAX_JUMP_DEPTH {
        return Some(Verdict::Drop);
    }

    for rule in &chain.rules {
        match run_rule(table, rule, packet) {
            Outcome::Continue => {}
            Outcome::Verdict(verdict) => return Some(verdict),
            Outcome::Jump(target) => {
                let next = table.chains.get(&target)?;
                if let Some(verdict) = run_chain(table, next, packet, depth + 1) {
                    return Some(verdict);
                }
            }
        }
    }
    None
}

fn run_rule(table: &TableState, rule: &Rule, packet: &Packet) -> Outcome {
    for statement in &rule.statements {
        let matched = match statement {
            Statement::Protocol(protocol) => packet.protocol == *protocol,
            Statement::DestinationInSet(set) => table
                .sets
                .get(set)
                .map(|nets| nets.iter().any(|net| net.contains(&packet.destination)))
                .unwrap_or(false),
            Statement::DestinationPort(spec) => packet.port.map_or(false, |p| spec.contains(p)),
            Statement::Jump(target) => return Outcome::Jump(target.clone()),
            Statement::Accept => return Outcome::Verdict(Verdict::Accept),
            Statement::Drop => return Outcome::Verdict(Verdict::Drop),
            Statement::Masquerade => true,
        };
        if !matched {
            return Outcome::Continue;
        }
    }
    Outcome::Continue
}

/// Netfilter backend keeping its state in memory.
#[derive(Debug, Default)]
pub struct MemoryNetfilter {
    ruleset: Mutex<Ruleset>,
    history: Mutex<Vec<Batch>>,
    /// Commits to let through before failing, and the failure message
    fail_at: Mutex<Option<(usize, String)>>,
}

impl MemoryNetfilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail with the given message, leaving state untouched.
    pub fn fail_next_commit(&self, message: impl Into<String>) {
        self.fail_commit_after(0, message);
    }

    /// Let `successes` commits through, then fail the one after them.
    ///
    /// Empty batches are not counted.
    pub fn fail_commit_after(&self, successes: usize, message: impl Into<String>) {
        *self.fail_at.lock() = Some((successes, message.into()));
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Ruleset {
        self.ruleset.lock().clone()
    }

    /// Every batch committed successfully, in order.
    pub fn history(&self) -> Vec<Batch> {
        self.history.lock().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.history.lock().len()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.ruleset.lock().tables.contains_key(table)
    }

    /// Rules of a chain, in evaluation order.
    pub fn rules(&self, table: &str, chain: &str) -> Vec<Rule> {
        self.ruleset
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.chains.get(chain))
            .map(|c| c.rules.clone())
            .unwrap_or_default()
    }

    /// Elements of a set, or `None` if the set does not exist.
    pub fn set_elements(&self, table: &str, set: &str) -> Option<Vec<Ipv4Net>> {
        self.ruleset
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.sets.get(set))
            .cloned()
    }

    /// Names of all sets in a table.
    pub fn sets(&self, table: &str) -> Vec<String> {
        self.ruleset
            .lock()
            .tables
            .get(table)
            .map(|t| t.sets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Evaluate a packet against the current state.
    pub fn evaluate(&self, packet: &Packet) -> Verdict {
        self.ruleset.lock().evaluate(packet)
    }
}

impl Netfilter for MemoryNetfilter {
    fn commit(&self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        {
            let mut fail_at = self.fail_at.lock();
            match fail_at.take() {
                Some((0, message)) => return Err(Error::Kernel(message)),
                Some((remaining, message)) => *fail_at = Some((remaining - 1, message)),
                None => {}
            }
        }

        let mut ruleset = self.ruleset.lock();
        let mut next = ruleset.clone();
        next.apply(batch)?;
        *ruleset = next;
        self.history.lock().push(batch.clone());
        Ok(())
    }
}
