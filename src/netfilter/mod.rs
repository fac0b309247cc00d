//! Kernel packet filtering objects and transactions.
//!
//! Changes to the kernel are expressed as a [`Batch`] of commands against a
//! single IPv4 table. A batch is committed through a [`Netfilter`] backend as
//! one transaction: either every command takes effect or none does.
//!
//! Two backends are provided:
//! - [`NftCommand`]: renders the batch as libnftables JSON and hands it to `nft`
//! - [`MemoryNetfilter`]: an in-process model with a packet evaluator

mod json;
mod memory;
mod nft;

pub use memory::{MemoryNetfilter, Packet, Ruleset, Verdict};
pub use nft::NftCommand;

use ipnet::Ipv4Net;

use crate::error::Result;
use crate::port::PortSpec;
use crate::Protocol;

/// Address family of every object managed here.
pub const FAMILY: &str = "ip";

/// A backend able to apply a batch atomically.
pub trait Netfilter: Send + Sync {
    /// Apply all commands of the batch in one transaction.
    fn commit(&self, batch: &Batch) -> Result<()>;
}

/// Chain type of a base chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainType {
    Filter,
    Nat,
}

/// Netfilter hook a base chain attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Forward,
    Postrouting,
}

/// Default verdict of a base chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Accept,
    Drop,
}

/// Hook binding of a base chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseChain {
    pub chain_type: ChainType,
    pub hook: Hook,
    pub priority: i32,
    pub policy: Policy,
}

/// A chain; regular chains are only reachable through a jump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub base: Option<BaseChain>,
}

impl Chain {
    pub fn regular(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
        }
    }

    pub fn base(name: impl Into<String>, base: BaseChain) -> Self {
        Self {
            name: name.into(),
            base: Some(base),
        }
    }
}

/// One instruction of a rule, evaluated left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `meta l4proto == <protocol>`
    Protocol(Protocol),
    /// `ip daddr == @<set>`
    DestinationInSet(String),
    /// `th dport == <port | range>`
    DestinationPort(PortSpec),
    /// `jump <chain>`
    Jump(String),
    Accept,
    Drop,
    Masquerade,
}

/// A rule appended to a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub chain: String,
    pub statements: Vec<Statement>,
    pub comment: Option<String>,
}

/// A single change within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddTable,
    DeleteTable,
    AddChain(Chain),
    /// Create an IPv4 interval set
    AddSet(String),
    FlushSet(String),
    AddElements { set: String, elements: Vec<Ipv4Net> },
    AddRule(Rule),
}

/// An ordered list of commands against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    table: String,
    commands: Vec<Command>,
}

impl Batch {
    /// Create an empty batch for a table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            commands: Vec::new(),
        }
    }

    /// Name of the table this batch operates on.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn add_table(&mut self) -> &mut Self {
        self.push(Command::AddTable)
    }

    pub fn delete_table(&mut self) -> &mut Self {
        self.push(Command::DeleteTable)
    }

    pub fn add_chain(&mut self, chain: Chain) -> &mut Self {
        self.push(Command::AddChain(chain))
    }

    pub fn add_set(&mut self, name: impl Into<String>) -> &mut Self {
        self.push(Command::AddSet(name.into()))
    }

    pub fn flush_set(&mut self, name: impl Into<String>) -> &mut Self {
        self.push(Command::FlushSet(name.into()))
    }

    /// Add elements to a set. Empty element lists are skipped.
    pub fn add_elements(&mut self, set: impl Into<String>, elements: Vec<Ipv4Net>) -> &mut Self {
        if elements.is_empty() {
            return self;
        }
        self.push(Command::AddElements {
            set: set.into(),
            elements,
        })
    }

    pub fn add_rule(
        &mut self,
        chain: impl Into<String>,
        statements: Vec<Statement>,
        comment: Option<String>,
    ) -> &mut Self {
        self.push(Command::AddRule(Rule {
            chain: chain.into(),
            statements,
            comment,
        }))
    }
}
