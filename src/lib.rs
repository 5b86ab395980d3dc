//! torgw - Tor gateway reconciler
//!
//! Turns a Linux access point into a Tor transparent-proxy gateway and keeps it
//! that way: every run drives the managed block in `torrc` and the NAT redirect
//! rules back to the declared state, then persists the rules for the next boot.
//!
//! # Architecture
//!
//! - [`core`] - Block editing, rule sets, the live rule table and the reconcile runner
//! - [`gateway`] - Builds the desired torrc block and rule set from configuration
//! - [`audit`] - Audit logging for every reconcile stage
//! - [`validators`] - Input validation for configuration values
//! - [`config`] - Configuration loading
//! - [`elevation`] - Privilege elevation for firewall binaries
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Timestamped, checksummed backup of `torrc` before every edit
//! - Atomic file writes that keep the original permissions
//! - Fail-fast stage ordering: no rule is touched after a failed edit
//! - Rules are persisted only after a fully successful apply

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod gateway;
pub mod utils;
pub mod validators;

/// Default location of Tor's configuration file.
///
/// Distro packagers can override it at build time with `TORGW_SYSTEM_TORRC_PATH`.
pub const SYSTEM_TORRC_PATH: &str = match option_env!("TORGW_SYSTEM_TORRC_PATH") {
    Some(path) => path,
    None => "/etc/tor/torrc",
};

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::rules::{FirewallRule, RuleSet};
pub use core::runner::{ReconcileResult, ReconcileRunner};
