//! Typed nft command construction and execution
//!
//! Every invocation of the external filter tool goes through [`NftCommand`],
//! which builds an argument vector. Nothing is ever passed through a shell, so
//! set names, paths and ports cannot be reinterpreted as syntax.
//!
//! [`NftRunner`] is the seam between the gateway and the process boundary.
//! [`SystemNft`] runs the real binary; tests substitute an in-memory fake.

use crate::core::error::{Error, Result};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use tracing::debug;

/// Address family and name of the managed table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub family: String,
    pub name: String,
}

impl Default for TableRef {
    fn default() -> Self {
        Self {
            family: "inet".to_string(),
            name: "filter".to_string(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.name)
    }
}

/// One nft invocation as an argument vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftCommand {
    args: Vec<String>,
}

impl NftCommand {
    fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn scoped(verb: &str, kind: &str, table: &TableRef, name: Option<&str>) -> Self {
        let mut args = vec![
            verb.to_string(),
            kind.to_string(),
            table.family.clone(),
            table.name.clone(),
        ];
        args.extend(name.map(String::from));
        Self { args }
    }

    pub fn version() -> Self {
        Self::new(["--version"])
    }

    pub fn list_tables() -> Self {
        Self::new(["list", "tables"])
    }

    pub fn list_table(table: &TableRef) -> Self {
        Self::scoped("list", "table", table, None)
    }

    pub fn list_chain(table: &TableRef, chain: &str) -> Self {
        Self::scoped("list", "chain", table, Some(chain))
    }

    pub fn list_set(table: &TableRef, set: &str) -> Self {
        Self::scoped("list", "set", table, Some(set))
    }

    pub fn add_table(table: &TableRef) -> Self {
        Self::scoped("add", "table", table, None)
    }

    /// `add rule <family> <table> <chain> <expr...>`
    pub fn add_rule(table: &TableRef, chain: &str, expr: &[&str]) -> Self {
        let mut cmd = Self::scoped("add", "rule", table, Some(chain));
        cmd.args.extend(expr.iter().map(|s| (*s).to_string()));
        cmd
    }

    /// `add element <family> <table> <set> { <port> }`
    pub fn add_element(table: &TableRef, set: &str, port: u16) -> Self {
        let mut cmd = Self::scoped("add", "element", table, Some(set));
        cmd.args
            .extend(["{".to_string(), port.to_string(), "}".to_string()]);
        cmd
    }

    /// `delete element <family> <table> <set> { <port> }`
    pub fn delete_element(table: &TableRef, set: &str, port: u16) -> Self {
        let mut cmd = Self::scoped("delete", "element", table, Some(set));
        cmd.args
            .extend(["{".to_string(), port.to_string(), "}".to_string()]);
        cmd
    }

    pub fn flush_ruleset() -> Self {
        Self::new(["flush", "ruleset"])
    }

    /// `-f <path>`: apply a batch definition file
    pub fn apply_file(path: &Path) -> Self {
        Self::new(["-f".to_string(), path.to_string_lossy().into_owned()])
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Whether this command changes filter state
    pub fn is_mutation(&self) -> bool {
        matches!(
            self.args.first().map(String::as_str),
            Some("add" | "delete" | "flush" | "-f")
        )
    }
}

impl fmt::Display for NftCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nft {}", self.args.join(" "))
    }
}

/// Captured result of one nft invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NftOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl NftOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Executes nft commands
///
/// A non-zero exit is reported as `Ok` with `success == false`; `Err` is
/// reserved for failing to run the program at all.
pub trait NftRunner {
    fn run(&self, command: &NftCommand) -> impl Future<Output = Result<NftOutput>> + Send;
}

/// Runs the real `nft` binary (see [`crate::elevation`])
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNft;

impl NftRunner for SystemNft {
    async fn run(&self, command: &NftCommand) -> Result<NftOutput> {
        debug!("Running {command}");

        let output = crate::elevation::create_nft_command(command.args())?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolUnavailable(format!(
                        "{} not found in PATH",
                        crate::elevation::nft_program().to_string_lossy()
                    ))
                } else {
                    Error::Io(e)
                }
            })?;

        Ok(NftOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
