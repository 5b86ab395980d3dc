//! Core reconciliation functionality
//!
//! This module contains the building blocks of a reconcile run:
//!
//! - [`block`]: Managed block editing inside text configuration files
//! - [`rules`]: Firewall rule and rule set data structures, iptables rendering/parsing
//! - [`iptables`]: The live rule table seam and its iptables implementation
//! - [`applier`]: Flush-and-repopulate reconciliation of the live rule table
//! - [`persist`]: Persistence gateways that keep applied rules across restarts
//! - [`backup`]: Timestamped, checksummed config backups and restore
//! - [`preflight`]: Privilege checks run before anything is mutated
//! - [`runner`]: The linear reconcile state machine
//! - [`error`]: Error types for reconcile operations

pub mod applier;
pub mod backup;
pub mod block;
pub mod error;
pub mod iptables;
pub mod persist;
pub mod preflight;
pub mod rules;
pub mod runner;

#[cfg(test)]
pub mod test_helpers;
