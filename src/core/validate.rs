//! Rule drafts and the validator that turns them into normalized rules
//!
//! Drafts are the structured request payloads handed over by the transport
//! layer: every field is still text. [`validate`] is a pure function that
//! parses, checks and canonicalizes a draft, naming the failing field on
//! error.
//!
//! # Examples
//!
//! ```
//! use hostfw::core::validate::{validate, PortDraft, RuleDraft};
//!
//! let draft = RuleDraft::Port(PortDraft::new("tcp", "443, 80-80, 81", "accept"));
//! let rule = validate(&draft).unwrap();
//! assert_eq!(rule.target.ports().unwrap().to_string(), "80-81,443");
//! ```

use crate::core::error::{Error, Result};
use crate::core::rule::{
    Family, MAX_PORT_ENTRIES, NormalizedRule, PortRange, PortSpec, Protocol, Strategy, Target,
};
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Requested port rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortDraft {
    pub protocol: String,
    pub port_spec: String,
    pub strategy: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PortDraft {
    pub fn new(
        protocol: impl Into<String>,
        port_spec: impl Into<String>,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            port_spec: port_spec.into(),
            strategy: strategy.into(),
            source: None,
            description: String::new(),
            enabled: true,
        }
    }
}

/// Requested address rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressDraft {
    pub address: String,
    pub strategy: String,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AddressDraft {
    pub fn new(address: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            strategy: strategy.into(),
            family: None,
            protocol: None,
            port: None,
            description: String::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleDraft {
    Port(PortDraft),
    Address(AddressDraft),
}

fn default_true() -> bool {
    true
}

/// Validates and normalizes a rule draft.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the first failing field.
pub fn validate(draft: &RuleDraft) -> Result<NormalizedRule> {
    match draft {
        RuleDraft::Port(port) => validate_port_draft(port),
        RuleDraft::Address(address) => validate_address_draft(address),
    }
}

fn validate_port_draft(draft: &PortDraft) -> Result<NormalizedRule> {
    if draft.port_spec.trim().is_empty() && is_blank(draft.source.as_deref()) {
        return Err(missing_match());
    }

    let protocol = parse_protocol(&draft.protocol)?;
    let strategy = parse_strategy(&draft.strategy)?;
    let port_spec =
        parse_port_spec(&draft.port_spec).map_err(|m| Error::validation("port_spec", m))?;
    let source = match draft.source.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(text) => Some(parse_address(text, None).map_err(|m| Error::validation("source", m))?),
    };
    let description = validators::validate_description(&draft.description)
        .map_err(|m| Error::validation("description", m))?;

    Ok(NormalizedRule {
        strategy,
        target: Target::Port {
            protocol,
            port_spec,
            source,
        },
        enabled: draft.enabled,
        description,
    })
}

fn validate_address_draft(draft: &AddressDraft) -> Result<NormalizedRule> {
    if draft.address.trim().is_empty() {
        return Err(if is_blank(draft.port.as_deref()) {
            missing_match()
        } else {
            Error::validation("address", "Address is required for address rules")
        });
    }

    let strategy = parse_strategy(&draft.strategy)?;
    let family = match draft.family.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(text) => Some(
            text.parse::<Family>()
                .map_err(|_| Error::validation("family", format!("Unknown family '{text}'")))?,
        ),
    };
    let address =
        parse_address(&draft.address, family).map_err(|m| Error::validation("address", m))?;

    let protocol = match draft.protocol.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(text) => Some(parse_protocol(text)?),
    };
    let port = match draft.port.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(text) => Some(parse_port_spec(text).map_err(|m| Error::validation("port", m))?),
    };
    if port.is_some() && protocol.is_none() {
        return Err(Error::validation(
            "protocol",
            "A protocol (tcp or udp) is required when scoping by port",
        ));
    }

    let description = validators::validate_description(&draft.description)
        .map_err(|m| Error::validation("description", m))?;

    Ok(NormalizedRule {
        strategy,
        target: Target::Address {
            address,
            protocol,
            port,
        },
        enabled: draft.enabled,
        description,
    })
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

fn missing_match() -> Error {
    Error::validation(
        "rule",
        "Either a port specification or an address is required",
    )
}

fn parse_protocol(text: &str) -> Result<Protocol> {
    text.trim().parse().map_err(|_| {
        Error::validation(
            "protocol",
            format!("Protocol must be tcp or udp, got '{}'", text.trim()),
        )
    })
}

fn parse_strategy(text: &str) -> Result<Strategy> {
    text.trim().parse().map_err(|_| {
        Error::validation(
            "strategy",
            format!("Strategy must be accept or drop, got '{}'", text.trim()),
        )
    })
}

/// Parses a port specification: a single port, a range, or a comma-set.
///
/// Ranges accept both `80-90` and `80:90`. The result is normalized: sorted,
/// with overlapping and adjacent ranges merged (`80-80` becomes `80`).
///
/// # Errors
///
/// Returns `Err` with a human-readable message if any entry is malformed or
/// out of range, or if the set has more than [`MAX_PORT_ENTRIES`] entries.
pub fn parse_port_spec(text: &str) -> std::result::Result<PortSpec, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("Port specification is empty".to_string());
    }

    let entries: Vec<&str> = text.split(',').map(str::trim).collect();
    if entries.len() > MAX_PORT_ENTRIES {
        return Err(format!(
            "Too many port entries ({}, max {MAX_PORT_ENTRIES})",
            entries.len()
        ));
    }

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.is_empty() {
            return Err("Port specification contains an empty entry".to_string());
        }
        let range = match entry.split_once(['-', ':']) {
            Some((start, end)) => {
                let start = validators::parse_port(start)?;
                let end = validators::parse_port(end)?;
                let (start, end) = validators::validate_port_range(start, end)?;
                PortRange { start, end }
            }
            None => PortRange::single(validators::parse_port(entry)?),
        };
        ranges.push(range);
    }

    Ok(PortSpec::from_ranges(ranges))
}

/// Parses an IP address or CIDR and canonicalizes it.
///
/// Host bits are cleared (`192.168.1.7/24` becomes `192.168.1.0/24`); a bare
/// address becomes a host prefix. When `family` is given the address must
/// belong to it.
///
/// # Errors
///
/// Returns `Err` if the text is not an address/CIDR or the family mismatches.
pub fn parse_address(
    text: &str,
    family: Option<Family>,
) -> std::result::Result<IpNetwork, String> {
    let text = text.trim();
    let parsed = if text.contains('/') {
        text.parse::<IpNetwork>()
            .map_err(|e| format!("'{text}' is not a valid CIDR: {e}"))?
    } else {
        let ip: IpAddr = text
            .parse()
            .map_err(|_| format!("'{text}' is not a valid IP address"))?;
        IpNetwork::from(ip)
    };

    let canonical = IpNetwork::new(parsed.network(), parsed.prefix())
        .map_err(|e| format!("'{text}' is not a valid CIDR: {e}"))?;

    if let Some(expected) = family
        && Family::of(&canonical) != expected
    {
        return Err(format!("'{text}' is not an {expected} address"));
    }

    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{RuleKind, format_network};

    fn expect_field(result: Result<NormalizedRule>, field: &str) {
        match result {
            Err(Error::Validation { field: f, .. }) => assert_eq!(f, field),
            other => panic!("expected validation error on {field}, got {other:?}"),
        }
    }

    #[test]
    fn test_single_range_collapses() {
        assert_eq!(parse_port_spec("80-80").unwrap().to_string(), "80");
        assert_eq!(parse_port_spec("8000:8080").unwrap().to_string(), "8000-8080");
    }

    #[test]
    fn test_port_spec_rejects_out_of_range() {
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("65536").is_err());
        assert!(parse_port_spec("90-80").is_err());
        assert!(parse_port_spec("22,,80").is_err());
        assert!(parse_port_spec("1-2-3").is_err());
    }

    #[test]
    fn test_port_spec_entry_limit() {
        let fifteen: Vec<String> = (1..=15).map(|p| p.to_string()).collect();
        assert!(parse_port_spec(&fifteen.join(",")).is_ok());
        let sixteen: Vec<String> = (1..=16).map(|p| p.to_string()).collect();
        assert!(parse_port_spec(&sixteen.join(",")).is_err());
    }

    #[test]
    fn test_address_canonicalized() {
        let net = parse_address("192.168.1.77/24", None).unwrap();
        assert_eq!(net.to_string(), "192.168.1.0/24");
        let host = parse_address("10.1.2.3", None).unwrap();
        assert_eq!(format_network(&host), "10.1.2.3");
        let v6 = parse_address("2001:db8::1/32", None).unwrap();
        assert_eq!(v6.to_string(), "2001:db8::/32");
    }

    #[test]
    fn test_address_family_mismatch() {
        assert!(parse_address("10.0.0.1", Some(Family::Ipv6)).is_err());
        assert!(parse_address("::1", Some(Family::Ipv6)).is_ok());
        assert!(parse_address("not-an-ip", None).is_err());
        assert!(parse_address("10.0.0.0/33", None).is_err());
    }

    #[test]
    fn test_valid_port_draft() {
        let mut draft = PortDraft::new("TCP", "8080", "Accept");
        draft.source = Some("10.0.0.5/8".into());
        draft.description = "  api  ".into();
        let rule = validate(&RuleDraft::Port(draft)).unwrap();

        assert_eq!(rule.strategy, Strategy::Accept);
        assert_eq!(rule.target.kind(), RuleKind::Port);
        assert_eq!(rule.target.family(), Some(Family::Ipv4));
        assert_eq!(rule.target.network().unwrap().to_string(), "10.0.0.0/8");
        assert_eq!(rule.description, "api");
    }

    #[test]
    fn test_port_draft_errors_name_field() {
        expect_field(
            validate(&RuleDraft::Port(PortDraft::new("icmp", "80", "accept"))),
            "protocol",
        );
        expect_field(
            validate(&RuleDraft::Port(PortDraft::new("tcp", "80", "reject"))),
            "strategy",
        );
        expect_field(
            validate(&RuleDraft::Port(PortDraft::new("tcp", "70000", "accept"))),
            "port_spec",
        );
        expect_field(
            validate(&RuleDraft::Port(PortDraft::new("tcp", "", "accept"))),
            "rule",
        );
    }

    #[test]
    fn test_address_draft_requires_protocol_for_port() {
        let mut draft = AddressDraft::new("10.0.0.0/8", "drop");
        draft.port = Some("22".into());
        expect_field(validate(&RuleDraft::Address(draft.clone())), "protocol");

        draft.protocol = Some("tcp".into());
        let rule = validate(&RuleDraft::Address(draft)).unwrap();
        assert_eq!(rule.target.ports().unwrap().to_string(), "22");
    }

    #[test]
    fn test_address_draft_empty_everything() {
        expect_field(
            validate(&RuleDraft::Address(AddressDraft::new("", "drop"))),
            "rule",
        );
        let mut draft = AddressDraft::new(" ", "drop");
        draft.port = Some("22".into());
        expect_field(validate(&RuleDraft::Address(draft)), "address");
    }

    #[test]
    fn test_address_draft_declared_family() {
        let mut draft = AddressDraft::new("2001:db8::/48", "drop");
        draft.family = Some("ipv4".into());
        expect_field(validate(&RuleDraft::Address(draft.clone())), "address");

        draft.family = Some("ipv6".into());
        let rule = validate(&RuleDraft::Address(draft)).unwrap();
        assert_eq!(rule.target.family(), Some(Family::Ipv6));

        let mut bad = AddressDraft::new("10.0.0.1", "drop");
        bad.family = Some("ipx".into());
        expect_field(validate(&RuleDraft::Address(bad)), "family");
    }

    #[test]
    fn test_validate_is_deterministic() {
        let draft = RuleDraft::Port(PortDraft::new("udp", "53,5353,53", "accept"));
        assert_eq!(validate(&draft).unwrap(), validate(&draft).unwrap());
    }
}
