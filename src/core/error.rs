use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Core error types for torgw
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The managed block could not be located or replaced
    #[error("Managed block error: {0}")]
    Block(#[from] BlockError),

    /// Reconciling the live rule table failed part way
    #[error("Rule apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Persisting the applied rules failed
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Backup or restore of the config document failed
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    /// Required privileges are missing
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Configuration file is unreadable or invalid
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// iptables command execution failed
    #[error("iptables error: {message}")]
    Iptables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classifies the error for result records and audit entries.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Block(e) => e.kind(),
            Error::Apply(_) | Error::Iptables { .. } => ErrorKind::PartialApply,
            Error::Persist(_) => ErrorKind::PersistenceFailure,
            Error::Backup(_) => ErrorKind::BackupFailure,
            Error::PermissionDenied(_) | Error::Elevation(_) => ErrorKind::PermissionDenied,
            Error::Io(_) | Error::Serialization(_) | Error::Config(_) => ErrorKind::Io,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Error taxonomy surfaced in [`ErrorRecord`](crate::core::runner::ErrorRecord)s.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[strum(serialize = "malformed document")]
    MalformedDocument,
    #[strum(serialize = "ambiguous block")]
    AmbiguousBlock,
    #[strum(serialize = "partial apply")]
    PartialApply,
    #[strum(serialize = "permission denied")]
    PermissionDenied,
    #[strum(serialize = "backup failure")]
    BackupFailure,
    #[strum(serialize = "persistence failure")]
    PersistenceFailure,
    #[strum(serialize = "verification mismatch")]
    VerificationMismatch,
    #[strum(serialize = "i/o")]
    Io,
    #[strum(serialize = "internal")]
    Internal,
}

/// Managed block errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("Malformed document at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Ambiguous managed block: first pair starts at line {first}, another marker at line {second}")]
    Ambiguous { first: usize, second: usize },

    #[error("Invalid block content at entry {index}: {reason}")]
    InvalidContent { index: usize, reason: String },

    #[error("Invalid block marker tag: {0}")]
    InvalidMarker(String),
}

impl BlockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlockError::Ambiguous { .. } => ErrorKind::AmbiguousBlock,
            BlockError::Malformed { .. }
            | BlockError::InvalidContent { .. }
            | BlockError::InvalidMarker(_) => ErrorKind::MalformedDocument,
        }
    }
}

/// Rule apply errors. Every variant leaves the targeted chains flushed-but-incomplete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("Failed to flush {target}: {message}")]
    FlushFailed { target: String, message: String },

    #[error("Rule #{index} ({rule}) failed after {applied} rule(s) were applied: {message}")]
    InsertFailed {
        index: usize,
        rule: String,
        applied: usize,
        message: String,
    },

    #[error("Failed to read back {target}: {message}")]
    ReadBack { target: String, message: String },
}

impl ApplyError {
    /// Number of desired rules that made it into the live table.
    pub fn applied(&self) -> usize {
        match self {
            ApplyError::InsertFailed { applied, .. } => *applied,
            ApplyError::FlushFailed { .. } | ApplyError::ReadBack { .. } => 0,
        }
    }
}

/// Persistence gateway errors
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("{program} exited with {exit_code:?}: {message}")]
    Command {
        program: String,
        message: String,
        exit_code: Option<i32>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),
}

/// Backup-specific errors
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Backup checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Backup checksum missing: {0}")]
    ChecksumMissing(PathBuf),

    #[error("No backup found for {0}")]
    NotFound(PathBuf),

    #[error("Backup I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run torgw as root, or allow sudo/run0 for iptables")
                .with_suggestion("Set TORGW_ELEVATION_METHOD=sudo when using a NOPASSWD sudoers rule")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // Missing iptables
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables")
                .with_suggestion("Or set iptables_command in the torgw configuration")
                .with_help("https://wiki.debian.org/iptables");
        }

        // Missing kernel table (nat module not loaded)
        if lower.contains("can't initialize iptables table") || lower.contains("table does not exist")
        {
            return ErrorTranslation::new("The iptables table is not available in this kernel")
                .with_suggestion("Load the NAT module: sudo modprobe iptable_nat")
                .with_suggestion("Reboot after a kernel upgrade so matching modules are loaded");
        }

        // Unknown chain, target or match
        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Unknown chain, target or match")
                .with_suggestion("REDIRECT only exists in the nat table's PREROUTING and OUTPUT chains")
                .with_suggestion("Load the REDIRECT target: sudo modprobe xt_REDIRECT");
        }

        // Port errors
        if lower.contains("invalid port") || (lower.contains("port") && lower.contains("range")) {
            return ErrorTranslation::new("Invalid port or port range")
                .with_suggestion("Port numbers must be between 1 and 65535")
                .with_suggestion("Check trans_port and dns_port in the torgw configuration");
        }

        // Syntax errors
        if lower.contains("bad argument") || lower.contains("unknown option") {
            return ErrorTranslation::new("Invalid firewall rule syntax")
                .with_suggestion("Check interface names for typos")
                .with_suggestion("Port matches need an explicit tcp or udp protocol");
        }

        // Invalid interface
        if lower.contains("interface")
            && (lower.contains("invalid") || lower.contains("does not exist"))
        {
            return ErrorTranslation::new("Network interface not found or invalid")
                .with_suggestion("Check available interfaces: ip link show")
                .with_suggestion("Interface names are case-sensitive and max 15 chars");
        }

        // Lock contention
        if lower.contains("xtables lock") || lower.contains("resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process is holding the xtables lock")
                .with_suggestion("Wait a moment and run torgw again")
                .with_suggestion(
                    "Check for conflicting firewall managers: sudo systemctl status ufw firewalld",
                );
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Inspect the live table: sudo iptables -t nat -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
