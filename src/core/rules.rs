//! Firewall rule data structures and iptables rendering
//!
//! A [`FirewallRule`] is a `{table, chain, predicate, action}` tuple. Its
//! priority is implicit: the position it holds inside a [`RuleSet`]. The
//! predicate vocabulary is deliberately small (interface, protocol, destination
//! port, TCP SYN) and the only action is a local port redirect.
//!
//! Rules render to iptables arguments (`-i wlan0 -p udp --dport 53 -j REDIRECT
//! --to-ports 53`) and parse back from `iptables -S` output, which adds implicit
//! match modules (`-m udp`) and spells `--syn` as `--tcp-flags FIN,SYN,RST,ACK SYN`.
//!
//! # Example
//!
//! ```
//! use torgw::core::rules::{FirewallRule, Protocol, RuleSet};
//!
//! let mut rules = RuleSet::new();
//! rules.push(FirewallRule::redirect(Some("wlan0"), Protocol::Udp, Some(53), 53));
//! rules.push(FirewallRule::redirect_syn(Some("wlan0"), 9040));
//!
//! assert_eq!(
//!     rules.rules()[1].to_args().join(" "),
//!     "-i wlan0 -p tcp --syn -j REDIRECT --to-ports 9040"
//! );
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of rules accepted in a single rule set.
///
/// A gateway needs a handful; anything near this limit is a broken configuration.
pub const MAX_RULES: usize = 256;

/// iptables table
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    #[default]
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "mangle")]
    Mangle,
}

/// Built-in iptables chain
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Chain {
    #[default]
    #[strum(serialize = "PREROUTING")]
    Prerouting,
    #[strum(serialize = "INPUT")]
    Input,
    #[strum(serialize = "FORWARD")]
    Forward,
    #[strum(serialize = "OUTPUT")]
    Output,
    #[strum(serialize = "POSTROUTING")]
    Postrouting,
}

/// A `(table, chain)` pair the applier flushes and repopulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainRef {
    pub table: Table,
    pub chain: Chain,
}

impl ChainRef {
    pub const fn new(table: Table, chain: Chain) -> Self {
        Self { table, chain }
    }
}

impl fmt::Display for ChainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.chain)
    }
}

/// Transport protocol of a rule
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

/// What a rule matches. Together with table and chain it is the rule's identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchPredicate {
    /// Inbound interface (`-i`); `None` matches every interface
    #[serde(default)]
    pub interface: Option<String>,
    pub protocol: Protocol,
    /// Destination port (`--dport`); `None` is the wildcard port
    #[serde(default)]
    pub port: Option<u16>,
    /// Only match connection-opening TCP segments (`--syn`)
    #[serde(default)]
    pub syn_only: bool,
}

/// What happens to a matching packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// `-j REDIRECT --to-ports N`
    RedirectToPort(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(default)]
    pub table: Table,
    #[serde(default)]
    pub chain: Chain,
    #[serde(rename = "match")]
    pub predicate: MatchPredicate,
    pub action: RuleAction,
}

/// Identity of a rule inside a [`RuleSet`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey<'a> {
    pub table: Table,
    pub chain: Chain,
    pub predicate: &'a MatchPredicate,
}

impl FirewallRule {
    /// A `nat/PREROUTING` redirect of `protocol` traffic (optionally to one port).
    pub fn redirect(
        interface: Option<&str>,
        protocol: Protocol,
        port: Option<u16>,
        to_port: u16,
    ) -> Self {
        Self {
            table: Table::Nat,
            chain: Chain::Prerouting,
            predicate: MatchPredicate {
                interface: interface.map(String::from),
                protocol,
                port,
                syn_only: false,
            },
            action: RuleAction::RedirectToPort(to_port),
        }
    }

    /// A `nat/PREROUTING` redirect of every new TCP connection, whatever its port.
    pub fn redirect_syn(interface: Option<&str>, to_port: u16) -> Self {
        let mut rule = Self::redirect(interface, Protocol::Tcp, None, to_port);
        rule.predicate.syn_only = true;
        rule
    }

    pub fn key(&self) -> RuleKey<'_> {
        RuleKey {
            table: self.table,
            chain: self.chain,
            predicate: &self.predicate,
        }
    }

    pub fn target(&self) -> ChainRef {
        ChainRef::new(self.table, self.chain)
    }

    /// Rule arguments as passed after `iptables -t TABLE -A CHAIN`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(10);
        if let Some(iface) = &self.predicate.interface {
            args.push("-i".to_string());
            args.push(iface.clone());
        }
        args.push("-p".to_string());
        args.push(self.predicate.protocol.to_string());
        if let Some(port) = self.predicate.port {
            args.push("--dport".to_string());
            args.push(port.to_string());
        }
        if self.predicate.syn_only {
            args.push("--syn".to_string());
        }
        match self.action {
            RuleAction::RedirectToPort(port) => {
                args.push("-j".to_string());
                args.push("REDIRECT".to_string());
                args.push("--to-ports".to_string());
                args.push(port.to_string());
            }
        }
        args
    }

    /// Checks the rule against what iptables will accept.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the rule cannot be applied.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(iface) = &self.predicate.interface {
            crate::validators::validate_interface(iface)?;
        }
        if let Some(port) = self.predicate.port {
            crate::validators::validate_port(port)?;
        }
        if self.predicate.syn_only && self.predicate.protocol != Protocol::Tcp {
            return Err("--syn only applies to tcp rules".to_string());
        }
        match self.action {
            RuleAction::RedirectToPort(port) => {
                crate::validators::validate_port(port)?;
                if self.table != Table::Nat
                    || !matches!(self.chain, Chain::Prerouting | Chain::Output)
                {
                    return Err(format!(
                        "REDIRECT is only valid in nat/PREROUTING and nat/OUTPUT, not {}",
                        self.target()
                    ));
                }
            }
        }
        Ok(())
    }

    /// Parses one `-A CHAIN ...` line of `iptables -t TABLE -S` output.
    ///
    /// # Errors
    ///
    /// Returns `Err` for lines using options outside the rule vocabulary.
    pub fn parse_spec(table: Table, line: &str) -> Result<Self, String> {
        let mut tokens = line.split_whitespace();

        if tokens.next() != Some("-A") {
            return Err(format!("not an append rule: {line}"));
        }
        let chain: Chain = tokens
            .next()
            .ok_or("missing chain")?
            .parse()
            .map_err(|_| format!("unsupported chain in: {line}"))?;

        let mut interface = None;
        let mut protocol = None;
        let mut port = None;
        let mut syn_only = false;
        let mut target = None;
        let mut to_port = None;

        while let Some(token) = tokens.next() {
            let mut value = |name: &str| {
                tokens
                    .next()
                    .map(str::to_string)
                    .ok_or_else(|| format!("{name} without value"))
            };
            match token {
                "-i" | "--in-interface" => interface = Some(value("-i")?),
                "-p" | "--protocol" => {
                    let raw = value("-p")?;
                    protocol = Some(
                        raw.parse::<Protocol>()
                            .map_err(|_| format!("unsupported protocol {raw}"))?,
                    );
                }
                // Implicit match module added by iptables -S (e.g. "-m udp")
                "-m" | "--match" => {
                    value("-m")?;
                }
                "--dport" | "--destination-port" => port = Some(parse_port(&value("--dport")?)?),
                "--syn" => syn_only = true,
                "--tcp-flags" => {
                    let mask = value("--tcp-flags")?;
                    let comp = value("--tcp-flags")?;
                    if mask == "FIN,SYN,RST,ACK" && comp == "SYN" {
                        syn_only = true;
                    } else {
                        return Err(format!("unsupported tcp flags {mask} {comp}"));
                    }
                }
                "-j" | "--jump" => target = Some(value("-j")?),
                "--to-ports" => to_port = Some(parse_port(&value("--to-ports")?)?),
                other => return Err(format!("unsupported option {other}")),
            }
        }

        let protocol = protocol.ok_or("rule has no protocol")?;
        let action = match (target.as_deref(), to_port) {
            (Some("REDIRECT"), Some(port)) => RuleAction::RedirectToPort(port),
            (Some("REDIRECT"), None) => return Err("REDIRECT without --to-ports".to_string()),
            (Some(other), _) => return Err(format!("unsupported target {other}")),
            (None, _) => return Err("rule has no target".to_string()),
        };

        Ok(Self {
            table,
            chain,
            predicate: MatchPredicate {
                interface,
                protocol,
                port,
                syn_only,
            },
            action,
        })
    }
}

fn parse_port(raw: &str) -> Result<u16, String> {
    raw.parse::<u16>()
        .map_err(|_| format!("invalid port {raw}"))
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-t {} -A {} {}",
            self.table,
            self.chain,
            self.to_args().join(" ")
        )
    }
}

/// Ordered, key-unique sequence of firewall rules.
///
/// Order is significant: the packet filter is first-match-wins, so narrow
/// redirects must precede catch-all ones.
/// Serialized as a plain list. Deserializing goes through [`RuleSet::push`],
/// so duplicate keys collapse the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<FirewallRule>", into = "Vec<FirewallRule>")]
pub struct RuleSet {
    rules: Vec<FirewallRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule. A rule with the same `(table, chain, predicate)` key already
    /// present is overwritten in place (last write wins, first position kept).
    pub fn push(&mut self, rule: FirewallRule) {
        if let Some(existing) = self.rules.iter_mut().find(|r| r.key() == rule.key()) {
            *existing = rule;
        } else {
            self.rules.push(rule);
        }
    }

    pub fn rules(&self) -> &[FirewallRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Distinct chains referenced by the rules, in order of first use.
    pub fn chains(&self) -> Vec<ChainRef> {
        let mut chains: Vec<ChainRef> = Vec::new();
        for rule in &self.rules {
            let target = rule.target();
            if !chains.contains(&target) {
                chains.push(target);
            }
        }
        chains
    }

    /// Rules of one chain, in set order.
    pub fn for_chain(&self, target: ChainRef) -> impl Iterator<Item = &FirewallRule> {
        self.rules.iter().filter(move |r| r.target() == target)
    }

    /// Validates every rule and the overall size.
    pub fn validate(&self) -> Result<(), String> {
        if self.rules.len() > MAX_RULES {
            return Err(format!(
                "rule set has {} rules (max: {MAX_RULES})",
                self.rules.len()
            ));
        }
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate().map_err(|e| format!("rule #{i} ({rule}): {e}"))?;
        }
        Ok(())
    }

    /// Renders the set for `iptables-restore --noflush`: each targeted chain is
    /// flushed and refilled inside its table's transaction.
    pub fn to_restore_text(&self) -> String {
        use std::fmt::Write;

        let mut tables: Vec<Table> = Vec::new();
        for target in self.chains() {
            if !tables.contains(&target.table) {
                tables.push(target.table);
            }
        }

        let mut out = String::from("# Generated by torgw\n");
        for table in tables {
            let _ = writeln!(out, "*{table}");
            for target in self.chains().into_iter().filter(|c| c.table == table) {
                let _ = writeln!(out, "-F {}", target.chain);
                for rule in self.for_chain(target) {
                    let _ = writeln!(out, "-A {} {}", rule.chain, rule.to_args().join(" "));
                }
            }
            out.push_str("COMMIT\n");
        }
        out
    }
}

impl From<Vec<FirewallRule>> for RuleSet {
    fn from(rules: Vec<FirewallRule>) -> Self {
        rules.into_iter().collect()
    }
}

impl From<RuleSet> for Vec<FirewallRule> {
    fn from(set: RuleSet) -> Self {
        set.rules
    }
}

impl FromIterator<FirewallRule> for RuleSet {
    fn from_iter<I: IntoIterator<Item = FirewallRule>>(iter: I) -> Self {
        let mut set = RuleSet::new();
        for rule in iter {
            set.push(rule);
        }
        set
    }
}
