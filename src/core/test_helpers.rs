//! Shared test utilities for core module tests
//!
//! Stateful mocks for the trait seams of a reconcile run. They track actual
//! state (chain contents, saved rule sets) rather than call sequences, so tests
//! assert on the table a run leaves behind.
//!
//! All mocks use `Arc<Mutex<_>>` and are `Clone`, so a test keeps one handle
//! while the code under test owns the boxed other.
//!
//! This module is only compiled in test mode.

use crate::core::error::{Error, PersistError, Result};
use crate::core::iptables::RuleTable;
use crate::core::persist::PersistenceGateway;
use crate::core::preflight::PrivilegeCheck;
use crate::core::rules::{ChainRef, FirewallRule, Protocol, RuleSet};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};

/// One-time initialization flag for the elevation bypass
static NO_ELEVATION_INIT: Once = Once::new();

/// Makes every elevated command run directly.
///
/// Thread-safe and idempotent; there is no guard to hold, so async tests can
/// call it first and then `.await` freely. Tests only ever set the variable,
/// never remove it.
pub fn setup_no_elevation() {
    NO_ELEVATION_INIT.call_once(|| {
        // SAFETY: Called once due to Once, and only in test code. The value is
        // never changed afterwards.
        unsafe {
            std::env::set_var("TORGW_TEST_NO_ELEVATION", "1");
        }
    });
}

/// The canonical gateway rule set: DNS first, then every new TCP connection.
pub fn gateway_rules() -> RuleSet {
    [
        FirewallRule::redirect(Some("wlan0"), Protocol::Udp, Some(53), 53),
        FirewallRule::redirect_syn(Some("wlan0"), 9040),
    ]
    .into_iter()
    .collect()
}

pub fn gateway_block() -> Vec<String> {
    vec![
        "VirtualAddrNetwork 10.192.0.0/10".to_string(),
        "AutomapHostsOnResolve 1".to_string(),
        "TransPort 192.168.42.1:9040".to_string(),
        "DNSPort 192.168.42.1:53".to_string(),
    ]
}

pub const SAMPLE_TORRC: &str = "\
## Configuration file for a typical Tor user
SocksPort 9050
RunAsDaemon 1
DataDirectory /var/lib/tor
";

// ============================================================================
// MemoryRuleTable
// ============================================================================

#[derive(Debug, Default)]
pub struct TableState {
    /// `-A CHAIN args` lines per chain, in order
    pub chains: HashMap<ChainRef, Vec<String>>,
    /// Map of operation name (`flush`, `append`, `list`) -> error message
    pub fail_on: HashMap<String, String>,
    /// Appends whose arguments contain the key fail with the value
    pub fail_append_containing: Option<(String, String)>,
    /// Appends whose arguments contain this succeed without taking effect
    pub drop_append_containing: Option<String>,
    pub flush_calls: usize,
    pub append_calls: usize,
}

impl TableState {
    fn check_fail(&self, op: &str) -> Result<()> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(table_error(msg))
        } else {
            Ok(())
        }
    }
}

fn table_error(msg: &str) -> Error {
    Error::Iptables {
        message: msg.to_string(),
        stderr: Some(msg.to_string()),
        exit_code: Some(1),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRuleTable {
    pub state: Arc<Mutex<TableState>>,
}

impl MemoryRuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw `-A ...` lines, as if another tool had installed them.
    pub fn seed(&self, target: ChainRef, lines: &[&str]) {
        let mut s = self.state.lock().unwrap();
        s.chains
            .entry(target)
            .or_default()
            .extend(lines.iter().map(|l| (*l).to_string()));
    }

    pub fn lines(&self, target: ChainRef) -> Vec<String> {
        let s = self.state.lock().unwrap();
        s.chains.get(&target).cloned().unwrap_or_default()
    }

    pub fn parsed_rules(&self, target: ChainRef) -> Vec<FirewallRule> {
        self.lines(target)
            .iter()
            .map(|l| FirewallRule::parse_spec(target.table, l).unwrap())
            .collect()
    }

    pub fn fail_on(&self, op: &str, msg: &str) {
        let mut s = self.state.lock().unwrap();
        s.fail_on.insert(op.to_string(), msg.to_string());
    }

    pub fn fail_append_containing(&self, needle: &str, msg: &str) {
        let mut s = self.state.lock().unwrap();
        s.fail_append_containing = Some((needle.to_string(), msg.to_string()));
    }

    pub fn drop_append_containing(&self, needle: &str) {
        let mut s = self.state.lock().unwrap();
        s.drop_append_containing = Some(needle.to_string());
    }

    pub fn flush_calls(&self) -> usize {
        self.state.lock().unwrap().flush_calls
    }

    pub fn append_calls(&self) -> usize {
        self.state.lock().unwrap().append_calls
    }
}

#[async_trait]
impl RuleTable for MemoryRuleTable {
    async fn flush_chain(&self, target: ChainRef) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("flush")?;
        s.flush_calls += 1;
        s.chains.insert(target, Vec::new());
        Ok(())
    }

    async fn append(&self, target: ChainRef, args: &[String]) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("append")?;
        s.append_calls += 1;

        let joined = args.join(" ");
        if let Some((needle, msg)) = &s.fail_append_containing
            && joined.contains(needle.as_str())
        {
            return Err(table_error(msg));
        }
        if let Some(needle) = &s.drop_append_containing
            && joined.contains(needle.as_str())
        {
            return Ok(());
        }

        s.chains
            .entry(target)
            .or_default()
            .push(format!("-A {} {joined}", target.chain));
        Ok(())
    }

    async fn list(&self, target: ChainRef) -> Result<Vec<String>> {
        let s = self.state.lock().unwrap();
        s.check_fail("list")?;
        let mut out = vec![format!("-P {} ACCEPT", target.chain)];
        out.extend(s.chains.get(&target).cloned().unwrap_or_default());
        Ok(out)
    }
}

// ============================================================================
// MemoryGateway
// ============================================================================

#[derive(Debug, Default)]
pub struct GatewayState {
    pub saved: Vec<RuleSet>,
    pub fail: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    pub state: Arc<Mutex<GatewayState>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(msg: &str) -> Self {
        let gateway = Self::default();
        gateway.state.lock().unwrap().fail = Some(msg.to_string());
        gateway
    }

    pub fn saves(&self) -> Vec<RuleSet> {
        self.state.lock().unwrap().saved.clone()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn save(&self, applied: &RuleSet) -> std::result::Result<(), PersistError> {
        let mut s = self.state.lock().unwrap();
        if let Some(msg) = &s.fail {
            return Err(PersistError::Command {
                program: "memory".to_string(),
                message: msg.clone(),
                exit_code: Some(1),
            });
        }
        s.saved.push(applied.clone());
        Ok(())
    }
}

// ============================================================================
// StaticPrivileges
// ============================================================================

/// Privilege check with a fixed answer
#[derive(Debug, Clone)]
pub struct StaticPrivileges {
    denied: Option<String>,
}

impl StaticPrivileges {
    pub fn granted() -> Self {
        Self { denied: None }
    }

    pub fn denied(msg: &str) -> Self {
        Self {
            denied: Some(msg.to_string()),
        }
    }
}

impl PrivilegeCheck for StaticPrivileges {
    fn check(&self, _document: &Path) -> Result<()> {
        match &self.denied {
            Some(msg) => Err(Error::PermissionDenied(msg.clone())),
            None => Ok(()),
        }
    }
}
