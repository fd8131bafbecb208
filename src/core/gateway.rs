//! Typed operations over the nft tool
//!
//! Queries (`list_*`) never fail: any non-zero exit or spawn error is read as
//! "object does not exist" and returned as `None`. Mutations return a typed
//! [`Error`] and are retried under the configured [`RetryPolicy`].
//!
//! Objects that need nested syntax (chains, sets) are created from a batch
//! definition written to a fresh temporary file and applied with `nft -f`.
//! The temporary file is removed when the call returns, whatever the outcome.

use crate::core::error::{Error, Result};
use crate::core::nft::{NftCommand, NftRunner, TableRef};
use crate::core::objects::{self, ChainSpec, SetSpec};
use crate::core::retry::{Fixed, RetryPolicy, run_with_retry};
use std::io::Write;
use tracing::{debug, info};

pub struct FilterGateway<R> {
    runner: R,
    table: TableRef,
    retry: Box<dyn RetryPolicy>,
}

impl<R: NftRunner + Sync> FilterGateway<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            table: TableRef::default(),
            retry: Box::new(Fixed::default()),
        }
    }

    pub fn with_retry(mut self, retry: Box<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Verifies the tool runs and that the caller may read filter state.
    ///
    /// # Errors
    ///
    /// - [`Error::ToolUnavailable`] if `nft --version` cannot be run or fails
    /// - [`Error::PermissionDenied`] if `nft list tables` fails
    pub async fn preflight(&self) -> Result<()> {
        let version = match self.runner.run(&NftCommand::version()).await {
            Ok(out) if out.success => out.stdout,
            Ok(out) => return Err(Error::ToolUnavailable(out.stderr.trim().to_string())),
            Err(Error::ToolUnavailable(msg)) => return Err(Error::ToolUnavailable(msg)),
            Err(e) => return Err(Error::ToolUnavailable(e.to_string())),
        };
        info!("Using {}", version.trim());

        match self.runner.run(&NftCommand::list_tables()).await {
            Ok(out) if out.success => Ok(()),
            Ok(out) => Err(Error::PermissionDenied(out.stderr.trim().to_string())),
            Err(e) => Err(Error::PermissionDenied(e.to_string())),
        }
    }

    async fn query(&self, command: NftCommand) -> Option<String> {
        match self.runner.run(&command).await {
            Ok(out) if out.success => Some(out.stdout),
            Ok(out) => {
                debug!("{command} exited with {:?}: {}", out.exit_code, out.stderr.trim());
                None
            }
            Err(e) => {
                debug!("{command} could not run: {e}");
                None
            }
        }
    }

    pub async fn list_table(&self) -> Option<String> {
        self.query(NftCommand::list_table(&self.table)).await
    }

    pub async fn list_chain(&self, chain: &str) -> Option<String> {
        self.query(NftCommand::list_chain(&self.table, chain)).await
    }

    pub async fn list_set(&self, set: &str) -> Option<String> {
        self.query(NftCommand::list_set(&self.table, set)).await
    }

    async fn mutate(&self, object: &str, command: &NftCommand) -> Result<()> {
        run_with_retry(self.retry.as_ref(), move || async move {
            debug!("Mutating {object}: {command}");
            let out = self.runner.run(command).await?;
            if out.success {
                Ok(())
            } else {
                Err(Error::from_nft_failure(object, &out.stderr, out.exit_code))
            }
        })
        .await
    }

    /// Writes `definition` to a temporary file and applies it with `nft -f`.
    async fn apply_batch(&self, object: &str, definition: &str) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("nft_tmp_")
            .suffix(".nft")
            .tempfile()?;
        file.write_all(definition.as_bytes())?;
        file.flush()?;

        let result = self
            .mutate(object, &NftCommand::apply_file(file.path()))
            .await;

        // Explicit close so a removal failure is at least logged
        if let Err(e) = file.close() {
            debug!("Failed to remove batch file for {object}: {e}");
        }
        result
    }

    pub async fn add_table(&self) -> Result<()> {
        let object = format!("table {}", self.table);
        self.mutate(&object, &NftCommand::add_table(&self.table))
            .await
    }

    pub async fn add_chain(&self, chain: &ChainSpec) -> Result<()> {
        let object = format!("chain {}", chain.name);
        self.apply_batch(&object, &objects::chain_batch(&self.table, chain))
            .await
    }

    /// Creates a set, seeded with `elements` when non-empty
    pub async fn add_set(&self, set: &SetSpec, elements: &[u16]) -> Result<()> {
        let object = format!("set {}", set.name);
        self.apply_batch(&object, &objects::set_batch(&self.table, set, elements))
            .await
    }

    pub async fn add_rule(&self, chain: &str, expr: &[&str]) -> Result<()> {
        let object = format!("rule '{}' in chain {chain}", expr.join(" "));
        self.mutate(&object, &NftCommand::add_rule(&self.table, chain, expr))
            .await
    }

    pub async fn add_element(&self, set: &str, port: u16) -> Result<()> {
        let object = format!("element {port} in set {set}");
        self.mutate(&object, &NftCommand::add_element(&self.table, set, port))
            .await
    }

    pub async fn delete_element(&self, set: &str, port: u16) -> Result<()> {
        let object = format!("element {port} in set {set}");
        self.mutate(&object, &NftCommand::delete_element(&self.table, set, port))
            .await
    }

    /// Removes every table, chain, set and rule. Destructive.
    pub async fn flush_ruleset(&self) -> Result<()> {
        self.mutate("ruleset", &NftCommand::flush_ruleset()).await
    }
}
