//! Abstraction over the live packet-filter table.
//!
//! Defines the [`RuleTable`] trait, the narrow seam through which every
//! non-idempotent firewall call goes. Production code uses [`IptablesCommand`];
//! tests use a stateful in-memory table (see `test_helpers`).

use crate::core::error::{Error, Result};
use crate::core::rules::ChainRef;
use async_trait::async_trait;
use tracing::{debug, error};

/// Flush/append/list operations on built-in chains.
///
/// Calls are awaited one at a time and have no timeout; a hung external
/// command blocks the run.
#[async_trait]
pub trait RuleTable: Send + Sync {
    /// Removes every rule of `target`.
    async fn flush_chain(&self, target: ChainRef) -> Result<()>;

    /// Appends one rule (arguments after `-A CHAIN`) to the end of `target`.
    async fn append(&self, target: ChainRef, args: &[String]) -> Result<()>;

    /// Lists `target` in `iptables -S` form, policy line included.
    async fn list(&self, target: ChainRef) -> Result<Vec<String>>;
}

/// Production [`RuleTable`] that shells out to `iptables`.
///
/// Commands go through [`crate::elevation`] and always pass `-w` so a
/// concurrent xtables user makes us wait instead of fail.
#[derive(Debug, Clone)]
pub struct IptablesCommand {
    program: String,
}

impl IptablesCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("{} {}", self.program, args.join(" "));

        let output = crate::elevation::create_elevated_command(&self.program, args)?
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.program);
                Error::Iptables {
                    message: format!("failed to spawn {}: {e}", self.program),
                    stderr: None,
                    exit_code: None,
                }
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("{} {} failed: {stderr}", self.program, args.join(" "));
            Err(Error::Iptables {
                message: stderr.clone(),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }
}

#[async_trait]
impl RuleTable for IptablesCommand {
    async fn flush_chain(&self, target: ChainRef) -> Result<()> {
        self.run(&[
            "-w",
            "-t",
            target.table.as_ref(),
            "-F",
            target.chain.as_ref(),
        ])
        .await?;
        Ok(())
    }

    async fn append(&self, target: ChainRef, args: &[String]) -> Result<()> {
        let mut full = vec!["-w", "-t", target.table.as_ref(), "-A", target.chain.as_ref()];
        full.extend(args.iter().map(String::as_str));
        self.run(&full).await?;
        Ok(())
    }

    async fn list(&self, target: ChainRef) -> Result<Vec<String>> {
        let stdout = self
            .run(&[
                "-w",
                "-t",
                target.table.as_ref(),
                "-S",
                target.chain.as_ref(),
            ])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}
