//! Desired state of a Tor transparent-proxy gateway
//!
//! Translates a [`GatewayConfig`] into the two things a run reconciles: the
//! directives of the managed `torrc` block and the NAT redirect rules for the
//! access-point interface.
//!
//! Rule order matters (first match wins): SSH to the gateway itself is
//! redirected to itself before the catch-all TCP redirect can send it to Tor.

use crate::config::GatewayConfig;
use crate::core::block::BlockMarker;
use crate::core::error::Result;
use crate::core::rules::{Chain, ChainRef, FirewallRule, Protocol, RuleSet, Table};
use crate::core::runner::ReconcilePlan;

/// The only chain a gateway plan owns
pub const MANAGED_CHAIN: ChainRef = ChainRef::new(Table::Nat, Chain::Prerouting);

const SSH_PORT: u16 = 22;

/// `torrc` directives, in the order Tor should read them.
pub fn torrc_directives(config: &GatewayConfig) -> Vec<String> {
    let mut lines = vec![
        format!("Log notice file {}", config.log_file.display()),
        format!("VirtualAddrNetwork {}", config.virtual_addr_network),
        format!("AutomapHostsSuffixes {}", config.automap_hosts_suffixes),
        "AutomapHostsOnResolve 1".to_string(),
        format!("TransPort {}:{}", config.ap_address, config.trans_port),
        format!("DNSPort {}:{}", config.ap_address, config.dns_port),
    ];
    lines.extend(config.extra_directives.iter().cloned());
    lines
}

/// NAT redirects for traffic entering on the access-point interface.
pub fn redirect_rules(config: &GatewayConfig) -> RuleSet {
    let iface = Some(config.interface.as_str());
    let mut rules = RuleSet::new();
    if config.redirect_ssh {
        rules.push(FirewallRule::redirect(
            iface,
            Protocol::Tcp,
            Some(SSH_PORT),
            SSH_PORT,
        ));
    }
    rules.push(FirewallRule::redirect(
        iface,
        Protocol::Udp,
        Some(53),
        config.dns_port,
    ));
    rules.push(FirewallRule::redirect_syn(iface, config.trans_port));
    rules
}

/// Builds the reconcile plan for `config`.
///
/// # Errors
///
/// Returns `Err` if the configured block tag cannot form marker lines.
pub fn plan(config: &GatewayConfig) -> Result<ReconcilePlan> {
    Ok(ReconcilePlan {
        document: config.torrc_path.clone(),
        marker: BlockMarker::new(&config.block_tag)?,
        block: torrc_directives(config),
        rules: redirect_rules(config),
        managed_chains: vec![MANAGED_CHAIN],
    })
}
