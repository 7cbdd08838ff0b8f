//! Firewall rule data structures
//!
//! This module defines the rule model shared by the catalogue, the reconciler
//! and the backends.
//!
//! # Rule Structure
//!
//! A [`Rule`] is either a port rule or an address rule ([`Target`]) with a
//! [`Strategy`] applied on match:
//! - Port rules match a protocol and a normalized [`PortSpec`], optionally
//!   scoped to a source network
//! - Address rules match a source network, optionally scoped to a protocol
//!   and port set
//!
//! Only enabled rules are projected to the backend, as [`RuleDescriptor`]s.
//!
//! # Limits
//!
//! The catalogue is limited to [`MAX_RULES`] rules and a port set to
//! [`MAX_PORT_ENTRIES`] entries.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum number of rules allowed in the catalogue
pub const MAX_RULES: usize = 1000;

/// Maximum number of entries in a comma-separated port set
///
/// Matches the iptables multiport limit so every backend can express the set.
pub const MAX_PORT_ENTRIES: usize = 15;

/// Prefix of the comment every backend rule managed by hostfw carries
pub const TAG_PREFIX: &str = "hostfw";

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum RuleKind {
    #[strum(serialize = "port")]
    Port,
    #[strum(serialize = "address")]
    Address,
}

/// Action taken when a packet matches a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Strategy {
    /// Accept the packet
    #[strum(serialize = "accept")]
    Accept,
    /// Drop the packet silently
    #[strum(serialize = "drop")]
    Drop,
}

impl Strategy {
    /// Verdict name in iptables target form
    pub const fn iptables_target(self) -> &'static str {
        match self {
            Strategy::Accept => "ACCEPT",
            Strategy::Drop => "DROP",
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Family {
    #[strum(serialize = "ipv4")]
    Ipv4,
    #[strum(serialize = "ipv6")]
    Ipv6,
}

impl Family {
    pub const fn of(network: &IpNetwork) -> Self {
        match network {
            IpNetwork::V4(_) => Family::Ipv4,
            IpNetwork::V6(_) => Family::Ipv6,
        }
    }

    /// nftables payload protocol for address matches
    pub const fn nft_payload(self) -> &'static str {
        match self {
            Family::Ipv4 => "ip",
            Family::Ipv6 => "ip6",
        }
    }
}

/// Transport protocol for port matching
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Ordered set of disjoint, non-adjacent port ranges.
///
/// Construct through [`crate::core::validate::parse_port_spec`] or
/// [`PortSpec::from_ranges`], both of which normalize.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortSpec(Vec<PortRange>);

impl PortSpec {
    /// Sorts and merges overlapping or adjacent ranges.
    pub fn from_ranges(mut ranges: Vec<PortRange>) -> Self {
        ranges.sort_unstable();
        let mut merged: Vec<PortRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if u32::from(range.start) <= u32::from(last.end) + 1 => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        Self(merged)
    }

    pub fn single(port: u16) -> Self {
        Self(vec![PortRange::single(port)])
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// iptables multiport form: `22,80:90`
    pub fn to_iptables(&self) -> String {
        self.0
            .iter()
            .map(|r| {
                if r.is_single() {
                    r.start.to_string()
                } else {
                    format!("{}:{}", r.start, r.end)
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for PortSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        crate::core::validate::parse_port_spec(&value)
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

/// Formats a network in minimal form: host prefixes print as a bare address.
pub fn format_network(network: &IpNetwork) -> String {
    let host_prefix = match network {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    };
    if network.prefix() == host_prefix {
        network.ip().to_string()
    } else {
        network.to_string()
    }
}

/// Kind-specific match fields of a rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    Port {
        protocol: Protocol,
        port_spec: PortSpec,
        #[serde(default)]
        source: Option<IpNetwork>,
    },
    Address {
        address: IpNetwork,
        #[serde(default)]
        protocol: Option<Protocol>,
        #[serde(default)]
        port: Option<PortSpec>,
    },
}

impl Target {
    pub const fn kind(&self) -> RuleKind {
        match self {
            Target::Port { .. } => RuleKind::Port,
            Target::Address { .. } => RuleKind::Address,
        }
    }

    /// Address family, or `None` for port rules that apply to both families
    pub fn family(&self) -> Option<Family> {
        match self {
            Target::Port { source, .. } => source.as_ref().map(Family::of),
            Target::Address { address, .. } => Some(Family::of(address)),
        }
    }

    pub fn network(&self) -> Option<&IpNetwork> {
        match self {
            Target::Port { source, .. } => source.as_ref(),
            Target::Address { address, .. } => Some(address),
        }
    }

    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Target::Port { protocol, .. } => Some(*protocol),
            Target::Address { protocol, .. } => *protocol,
        }
    }

    pub fn ports(&self) -> Option<&PortSpec> {
        match self {
            Target::Port { port_spec, .. } => Some(port_spec),
            Target::Address { port, .. } => port.as_ref(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Port {
                protocol,
                port_spec,
                source,
            } => {
                write!(f, "{protocol}/{port_spec}")?;
                if let Some(src) = source {
                    write!(f, " from {}", format_network(src))?;
                }
                Ok(())
            }
            Target::Address {
                address,
                protocol,
                port,
            } => {
                write!(f, "{}", format_network(address))?;
                match (protocol, port) {
                    (Some(proto), Some(port)) => write!(f, " {proto}/{port}"),
                    (Some(proto), None) => write!(f, " {proto}"),
                    _ => Ok(()),
                }
            }
        }
    }
}

/// Identity tuple used for duplicate detection among enabled rules
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleTuple {
    pub strategy: Strategy,
    pub target: Target,
}

impl fmt::Display for RuleTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.target.kind(), self.strategy, self.target)
    }
}

/// Validated rule content without catalogue identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRule {
    pub strategy: Strategy,
    pub target: Target,
    pub enabled: bool,
    pub description: String,
}

impl NormalizedRule {
    pub fn tuple(&self) -> RuleTuple {
        RuleTuple {
            strategy: self.strategy,
            target: self.target.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: Uuid,
    pub strategy: Strategy,
    #[serde(flatten)]
    pub target: Target,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Set when a rollback could not confirm this rule's backend state
    #[serde(default)]
    pub divergent: bool,
}

impl Rule {
    /// Creates a new catalogue record with a fresh id and timestamps.
    pub fn create(normalized: NormalizedRule) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            strategy: normalized.strategy,
            target: normalized.target,
            enabled: normalized.enabled,
            description: normalized.description,
            created_at: now,
            updated_at: now,
            divergent: false,
        }
    }

    /// Returns a copy with every semantically relevant field replaced.
    ///
    /// Identity and creation time are kept; `updated_at` is refreshed and
    /// the divergence flag cleared.
    pub fn replaced_with(&self, normalized: NormalizedRule) -> Self {
        Self {
            id: self.id,
            strategy: normalized.strategy,
            target: normalized.target,
            enabled: normalized.enabled,
            description: normalized.description,
            created_at: self.created_at,
            updated_at: chrono::Utc::now(),
            divergent: false,
        }
    }

    pub const fn kind(&self) -> RuleKind {
        self.target.kind()
    }

    pub fn family(&self) -> Option<Family> {
        self.target.family()
    }

    pub fn tuple(&self) -> RuleTuple {
        RuleTuple {
            strategy: self.strategy,
            target: self.target.clone(),
        }
    }

    /// Backend projection of this rule
    pub fn descriptor(&self) -> RuleDescriptor {
        RuleDescriptor {
            id: self.id,
            strategy: self.strategy,
            target: self.target.clone(),
            comment: crate::validators::sanitize_comment(&self.description),
        }
    }

    /// Lowercase text searched by description/address/port substring filters
    pub fn search_text(&self) -> String {
        let mut text = self.description.to_lowercase();
        if let Some(network) = self.target.network() {
            text.push('\n');
            text.push_str(&format_network(network));
        }
        if let Some(ports) = self.target.ports() {
            text.push('\n');
            text.push_str(&ports.to_string());
        }
        text
    }
}

fn default_true() -> bool {
    true
}

/// Rule as the backend sees it: identity tag plus match tuple.
///
/// The human description is carried only as a sanitized comment suffix and
/// does not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDescriptor {
    pub id: Uuid,
    pub strategy: Strategy,
    pub target: Target,
    #[serde(default)]
    pub comment: String,
}

impl PartialEq for RuleDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.strategy == other.strategy && self.target == other.target
    }
}

impl Eq for RuleDescriptor {}

impl RuleDescriptor {
    /// Backend comment tag, e.g. `hostfw:port:6f1c…`
    pub fn tag(&self) -> String {
        format!("{TAG_PREFIX}:{}:{}", self.target.kind(), self.id)
    }

    pub fn family(&self) -> Option<Family> {
        self.target.family()
    }

    pub const fn kind(&self) -> RuleKind {
        self.target.kind()
    }

    /// Parses a backend comment tag into kind and id.
    pub fn parse_tag(comment: &str) -> Option<(RuleKind, Uuid)> {
        let mut parts = comment.splitn(3, ':');
        if parts.next()? != TAG_PREFIX {
            return None;
        }
        let kind = parts.next()?.parse().ok()?;
        // Anything after the uuid (a space and description) is ignored
        let rest = parts.next()?;
        let id = rest.split_whitespace().next()?.parse().ok()?;
        Some((kind, id))
    }
}

impl fmt::Display for RuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.strategy, self.target, self.id)
    }
}
