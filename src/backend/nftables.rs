//! nftables backend
//!
//! Managed rules live in a dedicated `inet` table with one `input` base chain
//! (policy accept), so hostfw never touches rules it does not own. All
//! changes are sent as JSON batches through `nft --json -f -`.

use super::{BackendError, FirewallBackend, install_file, rule_comment, run_tool};
use crate::core::rule::{
    Family, PortRange, PortSpec, Protocol, RuleDescriptor, RuleKind, Strategy, Target,
};
use crate::elevation::Tool;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::{info, warn};

const CHAIN: &str = "input";

pub struct NftablesBackend {
    table: String,
    persist_path: PathBuf,
}

impl NftablesBackend {
    pub fn new(table: &str, persist_path: PathBuf) -> Self {
        Self {
            table: table.to_string(),
            persist_path,
        }
    }

    /// Table and base chain creation; `add` is a no-op when they exist.
    fn setup_commands(&self) -> [Value; 2] {
        [
            json!({ "add": { "table": { "family": "inet", "name": self.table } } }),
            json!({
                "add": {
                    "chain": {
                        "family": "inet",
                        "table": self.table,
                        "name": CHAIN,
                        "type": "filter",
                        "hook": "input",
                        "prio": 0,
                        "policy": "accept"
                    }
                }
            }),
        ]
    }

    /// `insert` places Drop rules at the top of the chain; `add` appends.
    fn rule_command(&self, rule: &RuleDescriptor) -> Value {
        let verb = match rule.strategy {
            Strategy::Drop => "insert",
            Strategy::Accept => "add",
        };
        json!({
            verb: {
                "rule": {
                    "family": "inet",
                    "table": self.table,
                    "chain": CHAIN,
                    "expr": rule_expressions(rule),
                    "comment": rule_comment(rule)
                }
            }
        })
    }

    fn delete_command(&self, handle: u64) -> Value {
        json!({
            "delete": {
                "rule": { "family": "inet", "table": self.table, "chain": CHAIN, "handle": handle }
            }
        })
    }

    async fn submit(&self, commands: Vec<Value>) -> Result<(), BackendError> {
        let payload = serde_json::to_string(&json!({ "nftables": commands }))
            .map_err(|e| BackendError::Rejected(format!("failed to encode nft batch: {e}")))?;
        run_tool(Tool::Nft, &["--json", "-f", "-"], Some(&payload)).await?;
        Ok(())
    }

    /// Lists managed rules with their handles; a missing table has none.
    async fn list_handles(&self) -> Result<Vec<(u64, Value)>, BackendError> {
        let output = match run_tool(
            Tool::Nft,
            &["--json", "list", "table", "inet", &self.table],
            None,
        )
        .await
        {
            Ok(output) => output,
            Err(BackendError::Unavailable(msg)) if is_missing_table(&msg) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let listing: Value = serde_json::from_str(&output)
            .map_err(|e| BackendError::Rejected(format!("unparseable nft listing: {e}")))?;
        Ok(rule_objects(&listing))
    }
}

fn is_missing_table(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no such file or directory") && lower.contains("list table")
}

/// Rule objects and their handles from a `nft --json list` document
fn rule_objects(listing: &Value) -> Vec<(u64, Value)> {
    listing
        .get("nftables")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("rule"))
                .filter(|rule| rule.get("chain").and_then(Value::as_str) == Some(CHAIN))
                .filter_map(|rule| Some((rule.get("handle")?.as_u64()?, rule.clone())))
                .collect()
        })
        .unwrap_or_default()
}

fn payload_match(protocol: &str, field: &str, right: Value) -> Value {
    json!({
        "match": {
            "left": { "payload": { "protocol": protocol, "field": field } },
            "op": "==",
            "right": right
        }
    })
}

fn meta_match(key: &str, value: impl serde::Serialize) -> Value {
    json!({
        "match": {
            "left": { "meta": { "key": key } },
            "op": "==",
            "right": value
        }
    })
}

fn network_value(network: &IpNetwork) -> Value {
    json!(crate::core::rule::format_network(network))
}

fn ports_value(spec: &PortSpec) -> Value {
    fn one(range: &PortRange) -> Value {
        if range.is_single() {
            json!(range.start)
        } else {
            json!({ "range": [range.start, range.end] })
        }
    }
    match spec.ranges() {
        [single] => one(single),
        ranges => json!({ "set": ranges.iter().map(one).collect::<Vec<_>>() }),
    }
}

/// nft JSON match expressions and verdict for a rule
pub fn rule_expressions(rule: &RuleDescriptor) -> Vec<Value> {
    let mut expressions = Vec::with_capacity(4);

    if let Some(network) = rule.target.network() {
        expressions.push(payload_match(
            Family::of(network).nft_payload(),
            "saddr",
            network_value(network),
        ));
    }
    if let Some(protocol) = rule.target.protocol() {
        expressions.push(meta_match("l4proto", protocol.as_str()));
        if let Some(ports) = rule.target.ports() {
            expressions.push(payload_match(protocol.as_str(), "dport", ports_value(ports)));
        }
    }

    expressions.push(match rule.strategy {
        Strategy::Accept => json!({ "accept": null }),
        Strategy::Drop => json!({ "drop": null }),
    });
    expressions
}

fn parse_network(value: &Value) -> Option<IpNetwork> {
    if let Some(text) = value.as_str() {
        return text.parse().ok();
    }
    let prefix = value.get("prefix")?;
    let addr = prefix.get("addr")?.as_str()?.parse().ok()?;
    let len = u8::try_from(prefix.get("len")?.as_u64()?).ok()?;
    IpNetwork::new(addr, len).ok()
}

fn parse_ports(value: &Value) -> Option<PortSpec> {
    fn one(value: &Value) -> Option<PortRange> {
        if let Some(port) = value.as_u64() {
            return Some(PortRange::single(u16::try_from(port).ok()?));
        }
        let bounds = value.get("range")?.as_array()?;
        let start = u16::try_from(bounds.first()?.as_u64()?).ok()?;
        let end = u16::try_from(bounds.get(1)?.as_u64()?).ok()?;
        Some(PortRange { start, end })
    }

    let ranges = match value.get("set").and_then(Value::as_array) {
        Some(items) => items.iter().map(one).collect::<Option<Vec<_>>>()?,
        None => vec![one(value)?],
    };
    Some(PortSpec::from_ranges(ranges))
}

/// Rebuilds a descriptor from a listed nft rule; `None` if not ours.
pub fn parse_rule(rule: &Value) -> Option<RuleDescriptor> {
    let comment = rule.get("comment")?.as_str()?;
    let (kind, id) = RuleDescriptor::parse_tag(comment)?;
    let description = comment
        .split_once(' ')
        .map(|(_, rest)| rest.to_string())
        .unwrap_or_default();

    let mut protocol = None;
    let mut network = None;
    let mut ports = None;
    let mut strategy = None;

    for expr in rule.get("expr")?.as_array()? {
        if expr.get("accept").is_some() {
            strategy = Some(Strategy::Accept);
        } else if expr.get("drop").is_some() {
            strategy = Some(Strategy::Drop);
        } else if let Some(m) = expr.get("match") {
            let left = m.get("left")?;
            let right = m.get("right")?;
            if left.pointer("/meta/key").and_then(Value::as_str) == Some("l4proto") {
                protocol = right.as_str().and_then(|p| p.parse::<Protocol>().ok());
            } else {
                match left.pointer("/payload/field").and_then(Value::as_str) {
                    Some("saddr") => network = parse_network(right),
                    Some("dport") => {
                        ports = parse_ports(right);
                        // nft drops `meta l4proto` when a `tcp dport` match implies it
                        if protocol.is_none() {
                            protocol = left
                                .pointer("/payload/protocol")
                                .and_then(Value::as_str)
                                .and_then(|p| p.parse::<Protocol>().ok());
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let target = match kind {
        RuleKind::Port => Target::Port {
            protocol: protocol?,
            port_spec: ports?,
            source: network,
        },
        RuleKind::Address => Target::Address {
            address: network?,
            protocol,
            port: ports,
        },
    };

    Some(RuleDescriptor {
        id,
        strategy: strategy?,
        target,
        comment: description,
    })
}

#[async_trait]
impl FirewallBackend for NftablesBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    async fn apply_rule(&self, rule: &RuleDescriptor) -> Result<(), BackendError> {
        let mut commands = Vec::with_capacity(4);
        for (handle, listed) in self.list_handles().await? {
            match parse_rule(&listed) {
                Some(existing) if existing.id == rule.id && existing == *rule => {
                    info!("nftables: {} already present", rule.tag());
                    return Ok(());
                }
                Some(existing) if existing.id == rule.id => {
                    warn!("nftables: replacing stale rule {}", rule.tag());
                    commands.push(self.delete_command(handle));
                }
                _ => {}
            }
        }

        let mut batch: Vec<Value> = self.setup_commands().into();
        batch.append(&mut commands);
        batch.push(self.rule_command(rule));
        self.submit(batch).await?;
        info!("nftables: applied {rule}");
        Ok(())
    }

    async fn remove_rule(&self, rule: &RuleDescriptor) -> Result<(), BackendError> {
        let handles: Vec<Value> = self
            .list_handles()
            .await?
            .into_iter()
            .filter(|(_, listed)| {
                listed
                    .get("comment")
                    .and_then(Value::as_str)
                    .and_then(RuleDescriptor::parse_tag)
                    .is_some_and(|(_, id)| id == rule.id)
            })
            .map(|(handle, _)| self.delete_command(handle))
            .collect();

        if handles.is_empty() {
            info!("nftables: {} already absent", rule.tag());
            return Ok(());
        }
        self.submit(handles).await?;
        info!("nftables: removed {rule}");
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<RuleDescriptor>, BackendError> {
        let mut active = Vec::new();
        for (handle, listed) in self.list_handles().await? {
            match parse_rule(&listed) {
                Some(rule) => active.push(rule),
                None => warn!("nftables: ignoring unrecognized rule handle {handle}"),
            }
        }
        Ok(active)
    }

    async fn persist(&self) -> Result<(), BackendError> {
        let listing = match run_tool(Tool::Nft, &["list", "table", "inet", &self.table], None).await
        {
            Ok(listing) => listing,
            Err(BackendError::Unavailable(msg)) if is_missing_table(&msg) => String::new(),
            Err(err) => return Err(err),
        };

        // Recreating the table first keeps reloads idempotent
        let contents = format!(
            "#!/usr/sbin/nft -f\ntable inet {table}\ndelete table inet {table}\n{listing}",
            table = self.table
        );
        install_file(&contents, &self.persist_path).await?;
        info!("nftables: persisted to {}", self.persist_path.display());
        Ok(())
    }
}
