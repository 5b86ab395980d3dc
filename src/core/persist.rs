//! Persistence of applied rules across reboots
//!
//! The live rule table is volatile. After a fully successful apply the runner
//! hands the rule set to a [`PersistenceGateway`], which makes the system
//! reload it at boot. A failed save is reported as a warning; the live table
//! is already correct.

use crate::core::error::PersistError;
use crate::core::rules::RuleSet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info};

/// Default file `iptables-save` output is stored in
pub const DEFAULT_RULES_FILE: &str = "/etc/iptables.ipv4.nat";

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Short human-readable description for logs and `status`
    fn describe(&self) -> String;

    /// Makes `applied` (now live) survive a reboot.
    async fn save(&self, applied: &RuleSet) -> Result<(), PersistError>;
}

/// How applied rules are persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum PersistenceMethod {
    /// Dump the whole table with `iptables-save` into a file restored at boot
    IptablesSave {
        #[serde(default = "default_rules_file")]
        path: PathBuf,
    },
    /// Delegate to the `netfilter-persistent` service
    NetfilterPersistent,
    /// Leave persistence to the administrator
    Disabled,
}

impl Default for PersistenceMethod {
    fn default() -> Self {
        Self::IptablesSave {
            path: default_rules_file(),
        }
    }
}

fn default_rules_file() -> PathBuf {
    PathBuf::from(DEFAULT_RULES_FILE)
}

impl PersistenceMethod {
    /// Builds the gateway for this method. `save_command` is the
    /// `iptables-save` binary to use.
    pub fn gateway(&self, save_command: &str) -> Box<dyn PersistenceGateway> {
        match self {
            Self::IptablesSave { path } => {
                Box::new(IptablesSaveFile::new(save_command, path.clone()))
            }
            Self::NetfilterPersistent => Box::new(NetfilterPersistent::default()),
            Self::Disabled => Box::new(Disabled),
        }
    }
}

async fn run_elevated(program: &str, args: &[&str]) -> Result<Vec<u8>, PersistError> {
    let output = crate::elevation::create_elevated_command(program, args)?
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| PersistError::Command {
            program: program.to_string(),
            message: format!("failed to spawn: {e}"),
            exit_code: None,
        })?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!("{program} failed: {stderr}");
        Err(PersistError::Command {
            program: program.to_string(),
            message: stderr,
            exit_code: output.status.code(),
        })
    }
}

/// Writes `iptables-save` output atomically to a rules file (mode 0644).
#[derive(Debug, Clone)]
pub struct IptablesSaveFile {
    save_command: String,
    path: PathBuf,
}

impl IptablesSaveFile {
    pub fn new(save_command: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            save_command: save_command.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl PersistenceGateway for IptablesSaveFile {
    fn describe(&self) -> String {
        format!("{} > {}", self.save_command, self.path.display())
    }

    async fn save(&self, applied: &RuleSet) -> Result<(), PersistError> {
        let dump = run_elevated(&self.save_command, &[]).await?;
        if dump.iter().all(u8::is_ascii_whitespace) {
            // Never replace a good boot file with an empty one
            return Err(PersistError::Command {
                program: self.save_command.clone(),
                message: "produced no output".to_string(),
                exit_code: Some(0),
            });
        }

        crate::utils::write_atomic(&self.path, &dump, 0o644).await?;
        info!(
            "Persisted {} rule(s) via {}",
            applied.len(),
            self.describe()
        );
        Ok(())
    }
}

/// Runs `netfilter-persistent save`.
#[derive(Debug, Clone)]
pub struct NetfilterPersistent {
    program: String,
}

impl NetfilterPersistent {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for NetfilterPersistent {
    fn default() -> Self {
        Self::new("netfilter-persistent")
    }
}

#[async_trait]
impl PersistenceGateway for NetfilterPersistent {
    fn describe(&self) -> String {
        format!("{} save", self.program)
    }

    async fn save(&self, applied: &RuleSet) -> Result<(), PersistError> {
        run_elevated(&self.program, &["save"]).await?;
        info!("Persisted {} rule(s) via {}", applied.len(), self.describe());
        Ok(())
    }
}

/// Persistence turned off; rules last until reboot.
#[derive(Debug, Clone, Copy)]
pub struct Disabled;

#[async_trait]
impl PersistenceGateway for Disabled {
    fn describe(&self) -> String {
        "disabled".to_string()
    }

    async fn save(&self, _applied: &RuleSet) -> Result<(), PersistError> {
        info!("Rule persistence disabled, live rules will not survive a reboot");
        Ok(())
    }
}
