//! libnftables JSON rendering of batches.

use ipnet::Ipv4Net;
use serde_json::{json, Value};

use super::{Batch, ChainType, Command, Hook, Policy, Statement, FAMILY};
use crate::port::PortSpec;

impl Batch {
    /// Render the batch as an `nft -j` input document.
    pub fn to_json(&self) -> Value {
        let mut items = Vec::with_capacity(self.commands.len() + 1);
        items.push(json!({ "metainfo": { "json_schema_version": 1 } }));
        for command in &self.commands {
            items.push(self.command_json(command));
        }
        json!({ "nftables": items })
    }

    fn command_json(&self, command: &Command) -> Value {
        let table = self.table.as_str();
        match command {
            Command::AddTable => json!({
                "add": { "table": { "family": FAMILY, "name": table } }
            }),
            Command::DeleteTable => json!({
                "delete": { "table": { "family": FAMILY, "name": table } }
            }),
            Command::AddChain(chain) => {
                let mut object = json!({
                    "family": FAMILY,
                    "table": table,
                    "name": chain.name,
                });
                if let Some(base) = &chain.base {
                    object["type"] = json!(match base.chain_type {
                        ChainType::Filter => "filter",
                        ChainType::Nat => "nat",
                    });
                    object["hook"] = json!(match base.hook {
                        Hook::Forward => "forward",
                        Hook::Postrouting => "postrouting",
                    });
                    object["prio"] = json!(base.priority);
                    object["policy"] = json!(match base.policy {
                        Policy::Accept => "accept",
                        Policy::Drop => "drop",
                    });
                }
                json!({ "add": { "chain": object } })
            }
            Command::AddSet(name) => json!({
                "add": { "set": {
                    "family": FAMILY,
                    "table": table,
                    "name": name,
                    "type": "ipv4_addr",
                    "flags": ["interval"],
                } }
            }),
            Command::FlushSet(name) => json!({
                "flush": { "set": { "family": FAMILY, "table": table, "name": name } }
            }),
            Command::AddElements { set, elements } => {
                let elem: Vec<Value> = elements.iter().map(element_json).collect();
                json!({
                    "add": { "element": {
                        "family": FAMILY,
                        "table": table,
                        "name": set,
                        "elem": elem,
                    } }
                })
            }
            Command::AddRule(rule) => {
                let expr: Vec<Value> = rule.statements.iter().map(statement_json).collect();
                let mut object = json!({
                    "family": FAMILY,
                    "table": table,
                    "chain": rule.chain,
                    "expr": expr,
                });
                if let Some(comment) = &rule.comment {
                    object["comment"] = json!(comment);
                }
                json!({ "add": { "rule": object } })
            }
        }
    }
}

/// Host addresses render bare, wider networks as prefixes.
fn element_json(net: &Ipv4Net) -> Value {
    if net.prefix_len() == 32 {
        json!(net.addr().to_string())
    } else {
        json!({ "prefix": { "addr": net.network().to_string(), "len": net.prefix_len() } })
    }
}

fn match_eq(left: Value, right: Value) -> Value {
    json!({ "match": { "op": "==", "left": left, "right": right } })
}

fn statement_json(statement: &Statement) -> Value {
    match statement {
        Statement::Protocol(protocol) => match_eq(
            json!({ "meta": { "key": "l4proto" } }),
            json!(protocol.as_str()),
        ),
        Statement::DestinationInSet(set) => match_eq(
            json!({ "payload": { "protocol": "ip", "field": "daddr" } }),
            json!(format!("@{}", set)),
        ),
        Statement::DestinationPort(port) => {
            let right = match *port {
                PortSpec::Single(p) => json!(p),
                PortSpec::Range(low, high) => json!({ "range": [low, high] }),
            };
            match_eq(json!({ "payload": { "protocol": "th", "field": "dport" } }), right)
        }
        Statement::Jump(target) => json!({ "jump": { "target": target } }),
        Statement::Accept => json!({ "accept": null }),
        Statement::Drop => json!({ "drop": null }),
        Statement::Masquerade => json!({ "masquerade": null }),
    }
}
