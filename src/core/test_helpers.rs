//! Shared test utilities for core module tests
//!
//! Provides an in-memory [`FakeNft`] that behaves like the parts of nft the
//! reconciler relies on: tables, base chains with textual rule listings, and
//! port sets. Batch files handed to `nft -f` are read and interpreted, so the
//! real definition text is exercised. This module is only compiled in test mode.

use crate::core::error::{Error, Result};
use crate::core::gateway::FilterGateway;
use crate::core::nft::{NftCommand, NftOutput, NftRunner};
use crate::core::retry::Fixed;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("NFTSYNC_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("NFTSYNC_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

#[derive(Debug, Default)]
struct FakeChain {
    header: String,
    rules: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    table: bool,
    chains: BTreeMap<String, FakeChain>,
    sets: BTreeMap<String, BTreeSet<u16>>,
    log: Vec<NftCommand>,
    batch_paths: Vec<PathBuf>,
    batch_texts: Vec<String>,
    failing_elements: HashSet<u16>,
    fail_batches: bool,
    fail_chain_listing: bool,
    deny_listing: bool,
    missing: bool,
}

/// In-memory stand-in for the nft binary
#[derive(Debug, Clone, Default)]
pub struct FakeNft {
    state: Arc<Mutex<FakeState>>,
}

impl FakeNft {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fake already holding the complete baseline and the given set contents
    pub fn converged(tcp: &[u16], udp: &[u16]) -> Self {
        let fake = Self::new();
        {
            let mut s = fake.state.lock().unwrap();
            s.table = true;
            for (name, header) in [
                ("input", "type filter hook input priority filter; policy drop;"),
                ("forward", "type filter hook forward priority filter; policy accept;"),
                ("output", "type filter hook output priority filter; policy accept;"),
            ] {
                s.chains.insert(
                    name.to_string(),
                    FakeChain {
                        header: header.to_string(),
                        rules: Vec::new(),
                    },
                );
            }
            if let Some(input) = s.chains.get_mut("input") {
                input.rules.push("tcp dport @tcp_services accept".to_string());
                input.rules.push("udp dport @udp_services accept".to_string());
            }
            s.sets
                .insert("tcp_services".to_string(), tcp.iter().copied().collect());
            s.sets
                .insert("udp_services".to_string(), udp.iter().copied().collect());
        }
        fake
    }

    pub fn fail_element(&self, port: u16) {
        self.state.lock().unwrap().failing_elements.insert(port);
    }

    pub fn fail_batches(&self, on: bool) {
        self.state.lock().unwrap().fail_batches = on;
    }

    pub fn fail_chain_listing(&self, on: bool) {
        self.state.lock().unwrap().fail_chain_listing = on;
    }

    pub fn deny_listing(&self, on: bool) {
        self.state.lock().unwrap().deny_listing = on;
    }

    pub fn set_missing(&self, on: bool) {
        self.state.lock().unwrap().missing = on;
    }

    pub fn push_rule(&self, chain: &str, rule: &str) {
        let mut s = self.state.lock().unwrap();
        if let Some(c) = s.chains.get_mut(chain) {
            c.rules.push(rule.to_string());
        }
    }

    /// Every command run so far, rendered as `nft ...`
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Rendered mutating commands only
    pub fn mutations(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|c| c.is_mutation())
            .map(ToString::to_string)
            .collect()
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations().len()
    }

    pub fn batch_paths(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().batch_paths.clone()
    }

    pub fn batch_texts(&self) -> Vec<String> {
        self.state.lock().unwrap().batch_texts.clone()
    }

    pub fn chain_names(&self) -> Vec<String> {
        self.state.lock().unwrap().chains.keys().cloned().collect()
    }

    pub fn chain_rules(&self, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(chain)
            .map(|c| c.rules.clone())
            .unwrap_or_default()
    }

    pub fn set_elements(&self, set: &str) -> Option<Vec<u16>> {
        self.state
            .lock()
            .unwrap()
            .sets
            .get(set)
            .map(|e| e.iter().copied().collect())
    }
}

fn not_found(what: &str) -> NftOutput {
    NftOutput::failed(1, format!("Error: No such file or directory\nlist {what}\n"))
}

fn render_chain(name: &str, chain: &FakeChain) -> String {
    let mut out = String::from("table inet filter {\n");
    let _ = writeln!(out, "\tchain {name} {{");
    let _ = writeln!(out, "\t\t{}", chain.header);
    for rule in &chain.rules {
        let _ = writeln!(out, "\t\t{rule}");
    }
    out.push_str("\t}\n}\n");
    out
}

fn render_set(name: &str, elements: &BTreeSet<u16>) -> String {
    let mut out = String::from("table inet filter {\n");
    let _ = writeln!(out, "\tset {name} {{");
    out.push_str("\t\ttype inet_service\n\t\tflags interval\n");
    if !elements.is_empty() {
        let list = elements
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "\t\telements = {{ {list} }}");
    }
    out.push_str("\t}\n}\n");
    out
}

impl FakeState {
    fn apply_batch(&mut self, text: &str) -> NftOutput {
        self.table = true;
        let mut current_set: Option<String> = None;

        for line in text.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("chain ") {
                let name = rest.split_whitespace().next().unwrap_or_default();
                if self.chains.contains_key(name) {
                    return NftOutput::failed(1, "Error: Could not process rule: File exists");
                }
                let header = rest
                    .split_once('{')
                    .map(|(_, h)| h.trim().trim_end_matches('}').trim().to_string())
                    .unwrap_or_default();
                self.chains.insert(
                    name.to_string(),
                    FakeChain {
                        header,
                        rules: Vec::new(),
                    },
                );
            } else if let Some(rest) = line.strip_prefix("set ") {
                let name = rest.split_whitespace().next().unwrap_or_default();
                if self.sets.contains_key(name) {
                    return NftOutput::failed(1, "Error: Could not process rule: File exists");
                }
                self.sets.insert(name.to_string(), BTreeSet::new());
                current_set = Some(name.to_string());
            } else if let Some(rest) = line.strip_prefix("elements = {") {
                if rest.trim() == "}" {
                    return NftOutput::failed(1, "Error: syntax error, unexpected '}'");
                }
                let ports: BTreeSet<u16> = rest
                    .trim_end_matches('}')
                    .split(',')
                    .filter_map(|p| p.trim().parse().ok())
                    .collect();
                if let Some(set) = current_set.as_ref().and_then(|n| self.sets.get_mut(n)) {
                    set.extend(ports);
                }
            }
        }
        NftOutput::ok("")
    }

    fn run(&mut self, cmd: &NftCommand) -> NftOutput {
        let args: Vec<&str> = cmd.args().iter().map(String::as_str).collect();
        match args.as_slice() {
            ["--version"] => NftOutput::ok("nftables v1.0.9 (Old Doc Yak #3)\n"),
            ["list", "tables"] => {
                if self.deny_listing {
                    NftOutput::failed(1, "Error: Operation not permitted")
                } else if self.table {
                    NftOutput::ok("table inet filter\n")
                } else {
                    NftOutput::ok("")
                }
            }
            ["list", "table", _, _] => {
                if self.table {
                    NftOutput::ok("table inet filter {\n}\n")
                } else {
                    not_found("table inet filter")
                }
            }
            ["list", "chain", _, _, name] => {
                if self.fail_chain_listing {
                    return NftOutput::failed(1, "Error: netlink: Error: Device or resource busy");
                }
                match self.chains.get(*name) {
                    Some(chain) => NftOutput::ok(render_chain(name, chain)),
                    None => not_found(name),
                }
            }
            ["list", "set", _, _, name] => match self.sets.get(*name) {
                Some(set) => NftOutput::ok(render_set(name, set)),
                None => not_found(name),
            },
            ["add", "table", _, _] => {
                self.table = true;
                NftOutput::ok("")
            }
            ["add", "rule", _, _, chain, expr @ ..] => match self.chains.get_mut(*chain) {
                Some(c) => {
                    c.rules.push(expr.join(" "));
                    NftOutput::ok("")
                }
                None => {
                    NftOutput::failed(1, "Error: No such file or directory; did you mean chain?")
                }
            },
            ["add", "element", _, _, set, "{", port, "}"] => {
                let Ok(port) = port.parse::<u16>() else {
                    return NftOutput::failed(1, "Error: syntax error");
                };
                if self.failing_elements.contains(&port) {
                    return NftOutput::failed(1, "Error: Could not process rule: Invalid argument");
                }
                match self.sets.get_mut(*set) {
                    Some(s) => {
                        s.insert(port);
                        NftOutput::ok("")
                    }
                    None => NftOutput::failed(
                        1,
                        "Error: Could not process rule: No such file or directory",
                    ),
                }
            }
            ["delete", "element", _, _, set, "{", port, "}"] => {
                let removed = port
                    .parse::<u16>()
                    .ok()
                    .zip(self.sets.get_mut(*set))
                    .is_some_and(|(p, s)| s.remove(&p));
                if removed {
                    NftOutput::ok("")
                } else {
                    NftOutput::failed(1, "Error: Could not process rule: No such file or directory")
                }
            }
            ["flush", "ruleset"] => {
                self.table = false;
                self.chains.clear();
                self.sets.clear();
                NftOutput::ok("")
            }
            ["-f", path] => {
                let path = PathBuf::from(path);
                let text = std::fs::read_to_string(&path).unwrap_or_default();
                self.batch_paths.push(path);
                self.batch_texts.push(text.clone());
                if self.fail_batches {
                    return NftOutput::failed(1, "Error: syntax error, unexpected junk");
                }
                self.apply_batch(&text)
            }
            _ => NftOutput::failed(1, "Error: syntax error, unexpected command"),
        }
    }
}

impl NftRunner for FakeNft {
    async fn run(&self, command: &NftCommand) -> Result<NftOutput> {
        let mut state = self.state.lock().unwrap();
        if state.missing {
            return Err(Error::ToolUnavailable("nft not found in PATH".to_string()));
        }
        state.log.push(command.clone());
        Ok(state.run(command))
    }
}

/// Gateway over `runner` that retries without sleeping
pub fn fast_gateway<R: NftRunner + Sync>(runner: R) -> FilterGateway<R> {
    FilterGateway::new(runner).with_retry(Box::new(Fixed {
        attempts: 3,
        delay: Duration::ZERO,
    }))
}
