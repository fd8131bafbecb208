//! Desired policy data model
//!
//! A [`Service`] is one allowed `(port, protocol)` pair with a descriptive name.
//! [`DesiredPolicy`] is the deduplicated, ordered collection the reconciler
//! converges the live filter state to. Identity is the `(port, protocol)` key;
//! the name never participates in equality of policy entries.
//!
//! The policy file is YAML:
//!
//! ```yaml
//! allowed_services:
//!   - name: ssh
//!     port: 22
//!     protocol: tcp
//!   - service: dns
//!     port: 53
//!     protocol: udp
//! ```

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use tracing::warn;

/// Transport protocol of an allowed service
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Name of the per-protocol set holding the allowed ports
    pub const fn set_name(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp_services",
            Protocol::Udp => "udp_services",
        }
    }
}

/// One allowed service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Service {
    pub fn new(name: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            port,
            protocol,
        }
    }

    /// Uniqueness key: `(port, protocol)`
    pub fn key(&self) -> (u16, Protocol) {
        (self.port, self.protocol)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.port, self.protocol)
    }
}

/// Deduplicated desired policy, in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredPolicy {
    services: Vec<Service>,
}

impl DesiredPolicy {
    /// Builds a policy keeping the first service seen for each `(port, protocol)` key.
    pub fn from_services(services: impl IntoIterator<Item = Service>) -> Self {
        let mut seen = HashSet::new();
        let services = services
            .into_iter()
            .filter(|s| seen.insert(s.key()))
            .collect();
        Self { services }
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Distinct ports for one protocol, ascending
    pub fn ports(&self, protocol: Protocol) -> Vec<u16> {
        self.services
            .iter()
            .filter(|s| s.protocol == protocol)
            .map(|s| s.port)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Result of loading a policy file: the usable policy plus every skipped entry
#[derive(Debug, Default)]
pub struct PolicyLoad {
    pub policy: DesiredPolicy,
    pub skipped: Vec<Error>,
}

/// Parses the YAML policy document.
///
/// Entries that fail validation are skipped individually and returned in
/// [`PolicyLoad::skipped`]. A document that is not a mapping yields an empty
/// policy.
///
/// # Errors
///
/// Returns `Err` only when the text is not valid YAML at all.
pub fn parse_policy(text: &str) -> Result<PolicyLoad> {
    let raw: Value = serde_yaml::from_str(text)?;

    let Value::Mapping(root) = raw else {
        warn!("Policy document is not a mapping, treating as empty");
        return Ok(PolicyLoad::default());
    };

    let entries = match root.get("allowed_services") {
        Some(Value::Sequence(seq)) => seq.as_slice(),
        Some(Value::Null) | None => &[],
        Some(_) => {
            warn!("allowed_services is not a list, treating as empty");
            &[]
        }
    };

    let mut services = Vec::with_capacity(entries.len());
    let mut skipped = Vec::new();

    for (index, item) in entries.iter().enumerate() {
        match parse_entry(item) {
            Ok(service) => services.push(service),
            Err(reason) => {
                warn!("Skipping malformed policy entry #{index}: {reason}");
                skipped.push(Error::MalformedEntry { index, reason });
            }
        }
    }

    Ok(PolicyLoad {
        policy: DesiredPolicy::from_services(services),
        skipped,
    })
}

fn parse_entry(item: &Value) -> std::result::Result<Service, String> {
    let Value::Mapping(map) = item else {
        return Err("entry is not a mapping".to_string());
    };

    let name = map
        .get("name")
        .or_else(|| map.get("service"))
        .and_then(scalar_to_string)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let port = match map.get("port") {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| format!("port {n} is not a non-negative integer"))?,
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("port '{s}' is not a number"))?,
        Some(other) => return Err(format!("port has unsupported type: {other:?}")),
        None => return Err("missing port".to_string()),
    };
    let port = u16::try_from(port).map_err(|_| format!("port {port} is out of range 0-65535"))?;

    let protocol = map
        .get("protocol")
        .and_then(scalar_to_string)
        .map_or(Protocol::Tcp, |p| {
            p.parse::<Protocol>().unwrap_or_else(|_| {
                warn!("Unknown protocol '{p}' for {name}, falling back to tcp");
                Protocol::Tcp
            })
        });

    Ok(Service::new(name, port, protocol))
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Loads the policy file, returning an empty policy when it does not exist.
///
/// # Errors
///
/// Returns `Err` if the file exists but cannot be read or is not valid YAML.
pub async fn load_policy(path: &Path) -> Result<PolicyLoad> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => parse_policy(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Policy file not found: {}", path.display());
            Ok(PolicyLoad::default())
        }
        Err(e) => Err(Error::Io(e)),
    }
}
