//! Filter objects managed by nftsync and their batch definitions
//!
//! The baseline is one `inet filter` table holding three base chains and one
//! port set per protocol. Objects that need nested syntax are created by
//! applying a small definition file rather than a single command line.

use crate::core::nft::TableRef;
use crate::core::service::Protocol;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Default verdict of a base chain
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ChainPolicy {
    Accept,
    #[default]
    Drop,
}

/// A base chain: hook and priority are fixed once created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    pub name: &'static str,
    pub hook: &'static str,
    pub priority: i32,
    pub policy: ChainPolicy,
}

impl ChainSpec {
    /// Chain header, e.g. `type filter hook input priority 0; policy drop;`
    pub fn header(&self) -> String {
        format!(
            "type filter hook {} priority {}; policy {};",
            self.hook, self.priority, self.policy
        )
    }
}

/// The three base chains in creation order
pub fn baseline_chains(input_policy: ChainPolicy) -> [ChainSpec; 3] {
    [
        ChainSpec {
            name: "input",
            hook: "input",
            priority: 0,
            policy: input_policy,
        },
        ChainSpec {
            name: "forward",
            hook: "forward",
            priority: 0,
            policy: ChainPolicy::Accept,
        },
        ChainSpec {
            name: "output",
            hook: "output",
            priority: 0,
            policy: ChainPolicy::Accept,
        },
    ]
}

/// Chain holding the per-protocol set rules
pub const INPUT_CHAIN: &str = "input";

/// A named port set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetSpec {
    pub name: &'static str,
    pub element_type: &'static str,
    pub flags: &'static str,
}

impl SetSpec {
    pub const fn for_protocol(protocol: Protocol) -> Self {
        Self {
            name: protocol.set_name(),
            element_type: "inet_service",
            flags: "interval",
        }
    }
}

/// Expression tokens of the rule accepting members of the protocol's set
pub fn set_accept_rule(protocol: Protocol) -> [&'static str; 4] {
    match protocol {
        Protocol::Tcp => ["tcp", "dport", "@tcp_services", "accept"],
        Protocol::Udp => ["udp", "dport", "@udp_services", "accept"],
    }
}

/// Text the set-accept rule has in a chain listing
pub fn set_accept_needle(protocol: Protocol) -> String {
    set_accept_rule(protocol).join(" ")
}

/// Writes a set block at `indent`.
///
/// An empty element list produces no `elements` line at all: several nft
/// releases reject `elements = { }`.
pub fn write_set_block(
    out: &mut String,
    set: &SetSpec,
    elements: &[u16],
    indent: &str,
    terminator: &str,
) {
    let _ = writeln!(out, "{indent}set {} {{", set.name);
    let _ = writeln!(out, "{indent}  type {}{terminator}", set.element_type);
    let _ = writeln!(out, "{indent}  flags {}{terminator}", set.flags);
    if !elements.is_empty() {
        let list = elements
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "{indent}  elements = {{ {list} }}");
    }
    let _ = writeln!(out, "{indent}}}");
}

/// Batch definition creating one set
pub fn set_batch(table: &TableRef, set: &SetSpec, elements: &[u16]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "table {} {} {{", table.family, table.name);
    write_set_block(&mut out, set, elements, "  ", ";");
    let _ = writeln!(out, "}}");
    out
}

/// Batch definition creating one chain
pub fn chain_batch(table: &TableRef, chain: &ChainSpec) -> String {
    format!(
        "table {} {} {{\n  chain {} {{ {} }}\n}}\n",
        table.family,
        table.name,
        chain.name,
        chain.header()
    )
}
