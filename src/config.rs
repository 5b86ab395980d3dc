//! Gateway configuration
//!
//! A JSON file whose every field has a default, so an empty object (or no
//! file at all) describes the stock Raspberry Pi setup: access point `wlan0`
//! on `192.168.42.1`, Tor's `TransPort` on 9040 and `DNSPort` on 53.

use crate::core::persist::PersistenceMethod;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("Failed to write configuration: {0}")]
    Write(#[from] std::io::Error),

    #[error("No configuration directory available; pass --config")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Tor configuration file the managed block is written to
    pub torrc_path: PathBuf,
    /// Tag of the `# BEGIN <tag>` / `# END <tag>` markers
    pub block_tag: String,
    /// Access-point interface whose traffic is redirected
    pub interface: String,
    /// Address Tor's `TransPort` and `DNSPort` listen on
    pub ap_address: String,
    pub trans_port: u16,
    pub dns_port: u16,
    pub log_file: PathBuf,
    pub virtual_addr_network: String,
    pub automap_hosts_suffixes: String,
    /// Keep SSH to the gateway itself reachable from the access point
    pub redirect_ssh: bool,
    /// Appended to the managed block verbatim, after the generated directives
    pub extra_directives: Vec<String>,
    pub persistence: PersistenceMethod,
    pub backup_retention: usize,
    pub iptables_command: String,
    pub iptables_save_command: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            torrc_path: PathBuf::from(crate::SYSTEM_TORRC_PATH),
            block_tag: "TOR-GATEWAY".to_string(),
            interface: "wlan0".to_string(),
            ap_address: "192.168.42.1".to_string(),
            trans_port: 9040,
            dns_port: 53,
            log_file: PathBuf::from("/var/log/tor/notices.log"),
            virtual_addr_network: "10.192.0.0/10".to_string(),
            automap_hosts_suffixes: ".onion,.exit".to_string(),
            redirect_ssh: true,
            extra_directives: Vec::new(),
            persistence: PersistenceMethod::default(),
            backup_retention: crate::core::backup::DEFAULT_RETENTION,
            iptables_command: "iptables".to_string(),
            iptables_save_command: "iptables-save".to_string(),
        }
    }
}

fn invalid(field: &'static str) -> impl FnOnce(String) -> ConfigError {
    move |message| ConfigError::Invalid { field, message }
}

impl GatewayConfig {
    /// Checks every field that reaches `torrc` or an iptables command line.
    /// Questionable but usable values only produce warnings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        use crate::validators::{
            check_ap_address, check_virtual_network, validate_directive, validate_interface,
            validate_ipv4, validate_network, validate_port, validate_suffixes, validate_tag,
        };

        validate_tag(&self.block_tag).map_err(invalid("block_tag"))?;
        validate_interface(&self.interface).map_err(invalid("interface"))?;
        let ap = validate_ipv4(&self.ap_address).map_err(invalid("ap_address"))?;
        validate_port(self.trans_port).map_err(invalid("trans_port"))?;
        validate_port(self.dns_port).map_err(invalid("dns_port"))?;
        if self.trans_port == self.dns_port {
            return Err(ConfigError::Invalid {
                field: "dns_port",
                message: format!("must differ from trans_port ({})", self.trans_port),
            });
        }
        let net = validate_network(&self.virtual_addr_network)
            .map_err(invalid("virtual_addr_network"))?;
        validate_suffixes(&self.automap_hosts_suffixes)
            .map_err(invalid("automap_hosts_suffixes"))?;

        if !self.log_file.is_absolute() {
            return Err(ConfigError::Invalid {
                field: "log_file",
                message: format!("{} is not an absolute path", self.log_file.display()),
            });
        }
        if self.torrc_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "torrc_path",
                message: "cannot be empty".to_string(),
            });
        }
        for (i, line) in self.extra_directives.iter().enumerate() {
            validate_directive(line).map_err(|e| ConfigError::Invalid {
                field: "extra_directives",
                message: format!("entry {i}: {e}"),
            })?;
        }
        for (field, command) in [
            ("iptables_command", &self.iptables_command),
            ("iptables_save_command", &self.iptables_save_command),
        ] {
            if command.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    message: "cannot be empty".to_string(),
                });
            }
        }

        if let Some(warning) = check_ap_address(ap) {
            warn!("ap_address: {warning}");
        }
        if let Some(warning) = check_virtual_network(net) {
            warn!("{warning}");
        }
        Ok(())
    }
}

/// Resolves `--config` or the default location.
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => crate::utils::default_config_path().ok_or(ConfigError::NoConfigDir),
    }
}

/// Loads and validates the configuration at `path`.
///
/// A missing file yields the defaults. A file that exists but cannot be read
/// or parsed is an error; a gateway must never run on half-understood settings.
pub async fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let config = match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str::<GatewayConfig>(&json).map_err(|source| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} not found, using defaults", path.display());
            GatewayConfig::default()
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    config.validate()?;
    Ok(config)
}

/// Saves the configuration using an atomic write (mode 0o600).
pub async fn save_config(config: &GatewayConfig, path: &Path) -> Result<(), ConfigError> {
    let mut json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    json.push('\n');

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)?;
    }

    crate::utils::write_atomic(path, json.as_bytes(), 0o600).await?;
    info!("Configuration written to {}", path.display());
    Ok(())
}
