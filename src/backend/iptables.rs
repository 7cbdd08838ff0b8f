//! iptables backend
//!
//! Managed rules live in a dedicated chain (default `HOSTFW`) jumped to from
//! the top of `INPUT`. IPv6 rules go through `ip6tables`; port rules without
//! a source scope are mirrored into both families and only count as active
//! when present in both.

use super::{BackendError, FirewallBackend, install_file, rule_comment, run_tool};
use crate::core::rule::{Family, Protocol, RuleDescriptor, RuleKind, Strategy, Target};
use crate::core::validate::parse_port_spec;
use crate::elevation::Tool;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct IptablesBackend {
    chain: String,
    persist_v4: PathBuf,
    persist_v6: PathBuf,
}

const fn tool_for(family: Family) -> Tool {
    match family {
        Family::Ipv4 => Tool::Iptables,
        Family::Ipv6 => Tool::Ip6tables,
    }
}

fn families_of(rule: &RuleDescriptor) -> &'static [Family] {
    match rule.target.family() {
        Some(Family::Ipv4) => &[Family::Ipv4],
        Some(Family::Ipv6) => &[Family::Ipv6],
        None => &[Family::Ipv4, Family::Ipv6],
    }
}

/// Match and target arguments for a rule, without the chain command
pub fn rule_args(rule: &RuleDescriptor) -> Vec<String> {
    let mut args = Vec::with_capacity(12);
    if let Some(network) = rule.target.network() {
        args.extend(["-s".to_string(), network.to_string()]);
    }
    if let Some(protocol) = rule.target.protocol() {
        args.extend(["-p".to_string(), protocol.as_str().to_string()]);
        if let Some(ports) = rule.target.ports() {
            args.extend([
                "-m".to_string(),
                "multiport".to_string(),
                "--dports".to_string(),
                ports.to_iptables(),
            ]);
        }
    }
    args.extend([
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        rule_comment(rule),
        "-j".to_string(),
        rule.strategy.iptables_target().to_string(),
    ]);
    args
}

/// Splits an `iptables -S` line into arguments, honoring double quotes.
fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;
    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        args.push(current);
    }
    args
}

/// A managed rule line from `iptables -S <chain>`
#[derive(Debug, Clone)]
struct ListedRule {
    /// Arguments after `-A <chain>`, reusable with `-D <chain>`
    args: Vec<String>,
    id: Uuid,
    descriptor: Option<RuleDescriptor>,
}

fn parse_line(chain: &str, line: &str) -> Option<ListedRule> {
    let tokens = split_args(line);
    if tokens.len() < 2 || tokens[0] != "-A" || tokens[1] != chain {
        return None;
    }
    let args = tokens[2..].to_vec();

    let mut network = None;
    let mut protocol = None;
    let mut ports = None;
    let mut comment = None;
    let mut strategy = None;

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "-s" => network = iter.next().and_then(|v| v.parse().ok()),
            "-p" => protocol = iter.next().and_then(|v| v.parse::<Protocol>().ok()),
            "--dports" | "--dport" => ports = iter.next().and_then(|v| parse_port_spec(v).ok()),
            "--comment" => comment = iter.next().cloned(),
            "-j" => {
                strategy = iter.next().and_then(|v| match v.as_str() {
                    "ACCEPT" => Some(Strategy::Accept),
                    "DROP" => Some(Strategy::Drop),
                    _ => None,
                });
            }
            "-m" => {
                iter.next();
            }
            _ => {}
        }
    }

    let comment = comment?;
    let (kind, id) = RuleDescriptor::parse_tag(&comment)?;
    let description = comment
        .split_once(' ')
        .map(|(_, rest)| rest.to_string())
        .unwrap_or_default();

    let target = match kind {
        RuleKind::Port => protocol.zip(ports).map(|(protocol, port_spec)| Target::Port {
            protocol,
            port_spec,
            source: network,
        }),
        RuleKind::Address => network.map(|address| Target::Address {
            address,
            protocol,
            port: ports,
        }),
    };
    let descriptor = target.zip(strategy).map(|(target, strategy)| RuleDescriptor {
        id,
        strategy,
        target,
        comment: description,
    });

    Some(ListedRule {
        args,
        id,
        descriptor,
    })
}

fn is_missing_chain(message: &str) -> bool {
    message.to_lowercase().contains("no chain/target/match")
}

impl IptablesBackend {
    pub fn new(chain: &str, persist_v4: PathBuf, persist_v6: PathBuf) -> Self {
        Self {
            chain: chain.to_string(),
            persist_v4,
            persist_v6,
        }
    }

    async fn ensure_chain(&self, tool: Tool) -> Result<(), BackendError> {
        match run_tool(tool, &["-N", &self.chain], None).await {
            Ok(_) => debug!("{tool}: created chain {}", self.chain),
            Err(BackendError::Rejected(msg)) if msg.to_lowercase().contains("already exists") => {}
            Err(err) => return Err(err),
        }

        match run_tool(tool, &["-C", "INPUT", "-j", &self.chain], None).await {
            Ok(_) => Ok(()),
            Err(BackendError::Rejected(_)) => {
                run_tool(tool, &["-I", "INPUT", "1", "-j", &self.chain], None).await?;
                info!("{tool}: jump from INPUT to {} installed", self.chain);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn list_family(&self, family: Family) -> Result<Vec<ListedRule>, BackendError> {
        let tool = tool_for(family);
        let output = match run_tool(tool, &["-S", &self.chain], None).await {
            Ok(output) => output,
            Err(BackendError::Rejected(msg)) if is_missing_chain(&msg) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(output
            .lines()
            .filter_map(|line| parse_line(&self.chain, line))
            .collect())
    }

    async fn delete_listed(&self, tool: Tool, listed: &ListedRule) -> Result<(), BackendError> {
        let mut args: Vec<&str> = vec!["-D", &self.chain];
        args.extend(listed.args.iter().map(String::as_str));
        run_tool(tool, &args, None).await?;
        Ok(())
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    async fn apply_rule(&self, rule: &RuleDescriptor) -> Result<(), BackendError> {
        let spec = rule_args(rule);
        for &family in families_of(rule) {
            let tool = tool_for(family);
            self.ensure_chain(tool).await?;

            let mut present = false;
            for listed in self.list_family(family).await? {
                if listed.id != rule.id {
                    continue;
                }
                if listed.descriptor.as_ref() == Some(rule) && listed.args == spec {
                    present = true;
                } else {
                    warn!("{tool}: replacing stale rule {}", rule.tag());
                    self.delete_listed(tool, &listed).await?;
                }
            }
            if present {
                info!("{tool}: {} already present", rule.tag());
                continue;
            }

            let mut args: Vec<&str> = match rule.strategy {
                Strategy::Drop => vec!["-I", &self.chain, "1"],
                Strategy::Accept => vec!["-A", &self.chain],
            };
            args.extend(spec.iter().map(String::as_str));
            run_tool(tool, &args, None).await?;
            info!("{tool}: applied {rule}");
        }
        Ok(())
    }

    async fn remove_rule(&self, rule: &RuleDescriptor) -> Result<(), BackendError> {
        for &family in families_of(rule) {
            let tool = tool_for(family);
            let matching: Vec<ListedRule> = self
                .list_family(family)
                .await?
                .into_iter()
                .filter(|listed| listed.id == rule.id)
                .collect();
            if matching.is_empty() {
                debug!("{tool}: {} already absent", rule.tag());
            }
            for listed in &matching {
                self.delete_listed(tool, listed).await?;
                info!("{tool}: removed {rule}");
            }
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<RuleDescriptor>, BackendError> {
        // id -> (descriptor, families it was seen in)
        let mut seen: BTreeMap<Uuid, (RuleDescriptor, Vec<Family>)> = BTreeMap::new();
        for family in [Family::Ipv4, Family::Ipv6] {
            for listed in self.list_family(family).await? {
                let Some(descriptor) = listed.descriptor else {
                    warn!("{}: ignoring unrecognized rule {}", tool_for(family), listed.id);
                    continue;
                };
                seen.entry(listed.id)
                    .or_insert_with(|| (descriptor, Vec::new()))
                    .1
                    .push(family);
            }
        }

        Ok(seen
            .into_values()
            .filter(|(descriptor, families)| {
                families_of(descriptor)
                    .iter()
                    .all(|family| families.contains(family))
            })
            .map(|(descriptor, _)| descriptor)
            .collect())
    }

    async fn persist(&self) -> Result<(), BackendError> {
        let v4 = run_tool(Tool::IptablesSave, &[], None).await?;
        install_file(&v4, &self.persist_v4).await?;
        let v6 = run_tool(Tool::Ip6tablesSave, &[], None).await?;
        install_file(&v6, &self.persist_v6).await?;
        info!(
            "iptables: persisted to {} and {}",
            self.persist_v4.display(),
            self.persist_v6.display()
        );
        Ok(())
    }
}
