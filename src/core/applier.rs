//! Flush-and-repopulate reconciliation of the live rule table
//!
//! Partial diffing of firewall rules is out of scope: every targeted chain is
//! flushed and refilled from the desired [`RuleSet`] in order. After a
//! successful [`RuleSetApplier::reconcile`] the live rules of each target equal
//! the desired rules for that target, so a second run with the same set
//! leaves the table unchanged and no stale rule survives.

use crate::core::error::ApplyError;
use crate::core::iptables::RuleTable;
use crate::core::rules::{ChainRef, FirewallRule, RuleSet};
use tracing::{debug, error, info, warn};

/// Outcome of a successful reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub flushed: Vec<ChainRef>,
    pub applied: usize,
}

/// One rule read back from the live table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveRule {
    Parsed(FirewallRule),
    /// A rule outside the rule vocabulary (someone else's, or hand-edited)
    Unrecognized { target: ChainRef, line: String },
}

impl LiveRule {
    fn render(&self) -> String {
        match self {
            LiveRule::Parsed(rule) => rule.to_string(),
            LiveRule::Unrecognized { target, line } => format!("-t {} {line}", target.table),
        }
    }
}

/// Comparison of the live table against the desired rule set
#[derive(Debug, Clone)]
pub struct Verification {
    pub matches: bool,
    pub expected: Vec<String>,
    pub actual: Vec<String>,
}

impl Verification {
    /// Line diff from expected to actual, `- ` / `+ ` prefixed.
    pub fn diff(&self) -> String {
        let expected = lines_text(&self.expected);
        let actual = lines_text(&self.actual);
        render_diff(&expected, &actual)
    }
}

fn lines_text(lines: &[String]) -> String {
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

/// Renders a line diff the way `plan` and verification reports show it.
pub fn render_diff(old_text: &str, new_text: &str) -> String {
    let diff = similar::TextDiff::from_lines(old_text, new_text);
    let mut out = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => "  ",
        };
        out.push_str(sign);
        out.push_str(change.value());
        if change.missing_newline() {
            out.push('\n');
        }
    }
    out
}

/// Drives the live rule table to a desired [`RuleSet`].
pub struct RuleSetApplier {
    table: Box<dyn RuleTable>,
    managed: Vec<ChainRef>,
}

impl RuleSetApplier {
    pub fn new(table: Box<dyn RuleTable>) -> Self {
        Self {
            table,
            managed: Vec::new(),
        }
    }

    /// Chains owned by torgw even when the desired set has no rule for them,
    /// so removing the last rule of a chain still clears it.
    pub fn with_managed_chains(mut self, chains: impl IntoIterator<Item = ChainRef>) -> Self {
        for chain in chains {
            if !self.managed.contains(&chain) {
                self.managed.push(chain);
            }
        }
        self
    }

    /// Managed chains followed by any other chain the desired set references.
    pub fn targets(&self, desired: &RuleSet) -> Vec<ChainRef> {
        let mut targets = self.managed.clone();
        for chain in desired.chains() {
            if !targets.contains(&chain) {
                targets.push(chain);
            }
        }
        targets
    }

    /// Flushes every target chain, then appends each desired rule in order.
    ///
    /// Stops at the first failure and never retries; the table is then left
    /// flushed-but-incomplete and the error says how far it got.
    ///
    /// # Errors
    ///
    /// - `ApplyError::FlushFailed` if a chain could not be flushed
    /// - `ApplyError::InsertFailed` if a rule was rejected
    pub async fn reconcile(&self, desired: &RuleSet) -> Result<ApplyReport, ApplyError> {
        let targets = self.targets(desired);
        info!(
            "Reconciling {} rule(s) across {} chain(s)",
            desired.len(),
            targets.len()
        );

        for target in &targets {
            debug!("Flushing {target}");
            self.table.flush_chain(*target).await.map_err(|e| {
                error!("Flush of {target} failed: {e}");
                ApplyError::FlushFailed {
                    target: target.to_string(),
                    message: e.to_string(),
                }
            })?;
        }

        for (index, rule) in desired.rules().iter().enumerate() {
            debug!("Appending rule #{index}: {rule}");
            self.table
                .append(rule.target(), &rule.to_args())
                .await
                .map_err(|e| {
                    error!("Rule #{index} ({rule}) rejected after {index} applied: {e}");
                    ApplyError::InsertFailed {
                        index,
                        rule: rule.to_string(),
                        applied: index,
                        message: e.to_string(),
                    }
                })?;
        }

        info!("Applied {} rule(s)", desired.len());
        Ok(ApplyReport {
            flushed: targets,
            applied: desired.len(),
        })
    }

    /// Reads back the rules of `targets` from the live table.
    pub async fn live_rules(&self, targets: &[ChainRef]) -> Result<Vec<LiveRule>, ApplyError> {
        let mut live = Vec::new();
        for target in targets {
            let lines = self
                .table
                .list(*target)
                .await
                .map_err(|e| ApplyError::ReadBack {
                    target: target.to_string(),
                    message: e.to_string(),
                })?;

            // Policy (-P) and chain definition (-N) lines are not rules
            for line in lines.into_iter().filter(|l| l.starts_with("-A ")) {
                match FirewallRule::parse_spec(target.table, &line) {
                    Ok(rule) => live.push(LiveRule::Parsed(rule)),
                    Err(reason) => {
                        warn!("Unrecognized rule in {target}: {line} ({reason})");
                        live.push(LiveRule::Unrecognized {
                            target: *target,
                            line,
                        });
                    }
                }
            }
        }
        Ok(live)
    }

    /// Compares the live table with `desired`. Reports, never corrects.
    pub async fn verify(&self, desired: &RuleSet) -> Result<Verification, ApplyError> {
        let targets = self.targets(desired);
        let live = self.live_rules(&targets).await?;

        let expected: Vec<String> = targets
            .iter()
            .flat_map(|t| desired.for_chain(*t))
            .map(ToString::to_string)
            .collect();
        let actual: Vec<String> = live.iter().map(LiveRule::render).collect();

        let matches = expected == actual;
        if matches {
            info!("Live rule table matches {} desired rule(s)", expected.len());
        } else {
            warn!(
                "Live rule table differs: expected {} rule(s), found {}",
                expected.len(),
                actual.len()
            );
        }

        Ok(Verification {
            matches,
            expected,
            actual,
        })
    }
}
