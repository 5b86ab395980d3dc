//! Privilege elevation for firewall binaries
//!
//! Editing `torrc` happens in-process and needs real write access, but the
//! firewall binaries (`iptables`, `iptables-save`, `netfilter-persistent`) can
//! be run through an elevation helper when torgw itself is not root.
//!
//! # Elevation Strategy
//!
//! - **Root**: commands run directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `TORGW_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful for boot scripts with sudoers NOPASSWD rules.
//! - `TORGW_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Arguments are passed directly, never through a shell
//! - Binaries (elevation helper, target program) are checked for availability

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// No elevation helper could be found
    #[error("No elevation method available (install sudo or PolicyKit, or run as root)")]
    NoMethodAvailable,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `TORGW_ELEVATION_METHOD`
    #[error("Invalid TORGW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How a privileged command will be run
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ElevationMethod {
    #[strum(serialize = "direct")]
    Direct,
    #[strum(serialize = "run0")]
    Run0,
    #[strum(serialize = "sudo")]
    Sudo,
    #[strum(serialize = "pkexec")]
    Pkexec,
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

pub fn is_root() -> bool {
    nix::unistd::getuid().is_root()
}

/// Decides how privileged commands will run in this process.
///
/// # Errors
///
/// Returns `Err` when `TORGW_ELEVATION_METHOD` is invalid or names a missing
/// helper, or when no helper exists at all.
pub fn resolve_method() -> Result<ElevationMethod, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("TORGW_TEST_NO_ELEVATION").is_ok() {
        return Ok(ElevationMethod::Direct);
    }

    // 2. Direct Root Execution (No prompt needed)
    if is_root() {
        return Ok(ElevationMethod::Direct);
    }

    let override_method = std::env::var("TORGW_ELEVATION_METHOD").ok();
    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    choose_method(override_method.as_deref(), is_atty, binary_exists)
}

/// Picks a helper for an unprivileged process.
fn choose_method(
    override_method: Option<&str>,
    is_atty: bool,
    exists: impl Fn(&str) -> bool,
) -> Result<ElevationMethod, ElevationError> {
    // Explicit elevation method override (for scripts with sudoers NOPASSWD, etc.)
    if let Some(method) = override_method.map(str::to_lowercase)
        && !method.is_empty()
    {
        let resolved = match method.as_str() {
            "sudo" => ElevationMethod::Sudo,
            "run0" => ElevationMethod::Run0,
            "pkexec" => ElevationMethod::Pkexec,
            _ => return Err(ElevationError::InvalidMethod(method)),
        };
        if !exists(&method) {
            return Err(ElevationError::MethodNotAvailable(method));
        }
        return Ok(resolved);
    }

    // Automatic detection - prefer run0 (modern, no SUID), fallback to sudo/pkexec
    if exists("run0") {
        return Ok(ElevationMethod::Run0);
    }
    if is_atty && exists("sudo") {
        return Ok(ElevationMethod::Sudo);
    }
    if exists("pkexec") {
        return Ok(ElevationMethod::Pkexec);
    }
    if exists("sudo") {
        // Boot scripts without a tty still work with NOPASSWD rules
        return Ok(ElevationMethod::Sudo);
    }

    Err(ElevationError::NoMethodAvailable)
}

/// Creates a command that runs `program` with root privileges.
///
/// The arguments are passed directly without shell interpretation.
///
/// # Example
///
/// ```no_run
/// use torgw::elevation::create_elevated_command;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let output = create_elevated_command("iptables", &["-t", "nat", "-S", "PREROUTING"])?
///     .output()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// # Testing
///
/// Set `TORGW_TEST_NO_ELEVATION=1` to run `program` directly.
pub fn create_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    let method = resolve_method()?;
    let mut cmd = match method {
        ElevationMethod::Direct => Command::new(program),
        ElevationMethod::Run0 => {
            let mut cmd = Command::new("run0");
            cmd.arg(program);
            cmd
        }
        ElevationMethod::Sudo => {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        }
        ElevationMethod::Pkexec => {
            let mut cmd = Command::new("pkexec");
            cmd.arg(program);
            cmd
        }
    };
    cmd.args(args);
    Ok(cmd)
}
