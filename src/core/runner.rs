//! The reconcile run
//!
//! A run is a linear state machine:
//!
//! ```text
//! Init -> Preflight -> Backup -> EditConfig -> ApplyRules -> Persist -> Verify -> Done
//! ```
//!
//! with `Failed` reachable from the first four stages. Those stages are fatal:
//! the first error ends the run and no later stage runs. Persist and Verify
//! only produce warnings, because once the rules are applied the live system
//! is already correct. Nothing is retried and nothing is rolled back; a
//! failed apply leaves the edited document in place and the backup is the
//! way back.

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::applier::RuleSetApplier;
use crate::core::backup::BackupStore;
use crate::core::block::{BlockMarker, ConfigDocument, ManagedBlockEditor};
use crate::core::error::{Error, ErrorKind};
use crate::core::iptables::RuleTable;
use crate::core::persist::PersistenceGateway;
use crate::core::preflight::PrivilegeCheck;
use crate::core::rules::{ChainRef, RuleSet};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Init,
    Preflight,
    Backup,
    EditConfig,
    ApplyRules,
    Persist,
    Verify,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Fatal,
    Warning,
}

/// One problem encountered during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: RunState,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
}

/// Outcome of a reconcile run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub run_id: Uuid,
    /// `Done` or `Failed`
    pub state: RunState,
    /// True when every mutating stage completed
    pub applied: bool,
    /// Whether the document was rewritten
    pub config_changed: bool,
    /// Rules live in the table when the run ended
    pub rules_applied: usize,
    pub backup_location: Option<PathBuf>,
    /// In the order they occurred
    pub errors: Vec<ErrorRecord>,
}

impl ReconcileResult {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Init,
            applied: false,
            config_changed: false,
            rules_applied: 0,
            backup_location: None,
            errors: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.errors
            .iter()
            .filter(|e| e.severity == Severity::Warning)
    }

    /// The error that ended a failed run
    pub fn fatal(&self) -> Option<&ErrorRecord> {
        self.errors.iter().find(|e| e.severity == Severity::Fatal)
    }

    /// Process exit code: 0 for Done (even with warnings), 1 for Failed.
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.is_done())
    }
}

/// Desired state for one run
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    pub document: PathBuf,
    pub marker: BlockMarker,
    pub block: Vec<String>,
    pub rules: RuleSet,
    /// Chains flushed even when `rules` has nothing for them
    pub managed_chains: Vec<ChainRef>,
}

/// Drives one [`ReconcilePlan`] through the run stages.
pub struct ReconcileRunner {
    plan: ReconcilePlan,
    privileges: Box<dyn PrivilegeCheck>,
    backups: BackupStore,
    applier: RuleSetApplier,
    gateway: Box<dyn PersistenceGateway>,
    audit: Option<AuditLog>,
    state: RunState,
}

impl ReconcileRunner {
    pub fn new(
        plan: ReconcilePlan,
        table: Box<dyn RuleTable>,
        gateway: Box<dyn PersistenceGateway>,
        privileges: Box<dyn PrivilegeCheck>,
    ) -> Self {
        let applier =
            RuleSetApplier::new(table).with_managed_chains(plan.managed_chains.iter().copied());
        Self {
            plan,
            privileges,
            backups: BackupStore::default(),
            applier,
            gateway,
            audit: None,
            state: RunState::Init,
        }
    }

    pub fn with_backup_retention(mut self, retention: usize) -> Self {
        self.backups = BackupStore::new(retention);
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn plan(&self) -> &ReconcilePlan {
        &self.plan
    }

    fn transition(&mut self, next: RunState) {
        info!("Reconcile: {} -> {}", self.state, next);
        self.state = next;
    }

    async fn audit(&self, run_id: Uuid, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record(&event.with_run_id(run_id)).await;
        }
    }

    /// Ends the run at the current stage.
    async fn fail(
        &mut self,
        mut result: ReconcileResult,
        event: EventType,
        err: &Error,
    ) -> ReconcileResult {
        let stage = self.state;
        error!("Reconcile failed during {stage}: {err}");
        result.errors.push(ErrorRecord {
            stage,
            kind: err.kind(),
            severity: Severity::Fatal,
            message: err.to_string(),
        });
        self.audit(
            result.run_id,
            AuditEvent::new(
                event,
                false,
                serde_json::json!({ "kind": err.kind() }),
                Some(err.to_string()),
            ),
        )
        .await;

        self.transition(RunState::Failed);
        result.state = RunState::Failed;
        self.finish(result).await
    }

    fn warn(&self, result: &mut ReconcileResult, kind: ErrorKind, message: String) {
        warn!("{} warning: {message}", self.state);
        result.errors.push(ErrorRecord {
            stage: self.state,
            kind,
            severity: Severity::Warning,
            message,
        });
    }

    async fn finish(&self, result: ReconcileResult) -> ReconcileResult {
        self.audit(
            result.run_id,
            AuditEvent::new(
                EventType::ReconcileFinished,
                result.is_done(),
                serde_json::json!({
                    "state": result.state,
                    "config_changed": result.config_changed,
                    "rules_applied": result.rules_applied,
                    "backup": result.backup_location,
                    "warnings": result.warnings().count(),
                }),
                result.fatal().map(|e| e.message.clone()),
            ),
        )
        .await;
        result
    }

    /// Runs every stage once. Never panics and never returns early without a
    /// terminal state: the outcome, fatal or not, is in the result.
    pub async fn run(&mut self) -> ReconcileResult {
        let run_id = Uuid::new_v4();
        let mut result = ReconcileResult::new(run_id);
        info!(
            "Reconcile run {run_id}: {} ({} block line(s), {} rule(s))",
            self.plan.document.display(),
            self.plan.block.len(),
            self.plan.rules.len()
        );

        self.transition(RunState::Preflight);
        if let Err(e) = self.privileges.check(&self.plan.document) {
            return self.fail(result, EventType::Preflight, &e).await;
        }
        if let Err(reason) = self.plan.rules.validate() {
            let e = Error::Internal(format!("invalid rule set: {reason}"));
            return self.fail(result, EventType::Preflight, &e).await;
        }
        self.audit(run_id, AuditEvent::new(EventType::Preflight, true, serde_json::json!({}), None))
            .await;

        self.transition(RunState::Backup);
        match self.backups.create(&self.plan.document).await {
            Ok(location) => {
                self.audit(
                    run_id,
                    AuditEvent::new(
                        EventType::Backup,
                        true,
                        serde_json::json!({ "backup": location }),
                        None,
                    ),
                )
                .await;
                result.backup_location = location;
            }
            Err(e) => return self.fail(result, EventType::Backup, &Error::from(e)).await,
        }

        self.transition(RunState::EditConfig);
        match self.edit_config().await {
            Ok(changed) => {
                self.audit(
                    run_id,
                    AuditEvent::new(
                        EventType::EditConfig,
                        true,
                        serde_json::json!({ "changed": changed }),
                        None,
                    ),
                )
                .await;
                result.config_changed = changed;
            }
            Err(e) => return self.fail(result, EventType::EditConfig, &e).await,
        }

        self.transition(RunState::ApplyRules);
        match self.applier.reconcile(&self.plan.rules).await {
            Ok(report) => {
                self.audit(
                    run_id,
                    AuditEvent::new(
                        EventType::ApplyRules,
                        true,
                        serde_json::json!({
                            "applied": report.applied,
                            "chains": report.flushed.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        }),
                        None,
                    ),
                )
                .await;
                result.rules_applied = report.applied;
            }
            Err(e) => {
                result.rules_applied = e.applied();
                if result.config_changed {
                    let message = format!(
                        "{} was edited and is not rolled back; `torgw restore` recovers it",
                        self.plan.document.display()
                    );
                    self.warn(&mut result, ErrorKind::PartialApply, message);
                }
                return self.fail(result, EventType::ApplyRules, &Error::from(e)).await;
            }
        }

        self.transition(RunState::Persist);
        let persisted = self.gateway.save(&self.plan.rules).await;
        if let Err(e) = &persisted {
            let message = format!("rules are live but will not survive a restart: {e}");
            self.warn(&mut result, ErrorKind::PersistenceFailure, message);
        }
        self.audit(
            run_id,
            AuditEvent::new(
                EventType::PersistRules,
                persisted.is_ok(),
                serde_json::json!({ "gateway": self.gateway.describe() }),
                persisted.err().map(|e| e.to_string()),
            ),
        )
        .await;

        self.transition(RunState::Verify);
        let (verified, detail) = match self.applier.verify(&self.plan.rules).await {
            Ok(v) if v.matches => (true, None),
            Ok(v) => {
                let diff = v.diff();
                let message = format!("live rules differ from the desired rules:\n{diff}");
                self.warn(&mut result, ErrorKind::VerificationMismatch, message);
                (false, Some(diff))
            }
            Err(e) => {
                let message = format!("could not read back live rules: {e}");
                self.warn(&mut result, ErrorKind::VerificationMismatch, message.clone());
                (false, Some(message))
            }
        };
        self.audit(
            run_id,
            AuditEvent::new(EventType::VerifyRules, verified, serde_json::json!({}), detail),
        )
        .await;

        self.transition(RunState::Done);
        result.state = RunState::Done;
        result.applied = true;
        info!(
            "Reconcile run {run_id} done with {} warning(s)",
            result.warnings().count()
        );
        self.finish(result).await
    }

    /// Replaces the managed block in the document, writing only on change.
    async fn edit_config(&self) -> Result<bool, Error> {
        let document = &self.plan.document;
        let (original, mode) = match tokio::fs::read_to_string(document).await {
            Ok(text) => (text, crate::utils::existing_mode(document).await),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (String::new(), None),
            Err(e) => return Err(e.into()),
        };

        let editor = ManagedBlockEditor::new(self.plan.marker.clone());
        let edited = editor.apply(&ConfigDocument::parse(&original), &self.plan.block)?;
        let rendered = edited.render();

        if rendered == original {
            info!("{} already up to date", document.display());
            return Ok(false);
        }

        crate::utils::write_atomic(document, rendered.as_bytes(), mode.unwrap_or(0o644)).await?;
        info!(
            "Wrote managed block `{}` ({} line(s)) to {}",
            self.plan.marker.tag(),
            self.plan.block.len(),
            document.display()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{
        MemoryGateway, MemoryRuleTable, SAMPLE_TORRC, StaticPrivileges, gateway_block,
        gateway_rules,
    };

    fn plan(document: PathBuf) -> ReconcilePlan {
        ReconcilePlan {
            document,
            marker: BlockMarker::new("TOR-GATEWAY").unwrap(),
            block: gateway_block(),
            rules: gateway_rules(),
            managed_chains: Vec::new(),
        }
    }

    fn runner(document: PathBuf, table: &MemoryRuleTable, gateway: &MemoryGateway) -> ReconcileRunner {
        ReconcileRunner::new(
            plan(document),
            Box::new(table.clone()),
            Box::new(gateway.clone()),
            Box::new(StaticPrivileges::granted()),
        )
    }

    #[tokio::test]
    async fn test_successful_run_reaches_done() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        std::fs::write(&doc, SAMPLE_TORRC).unwrap();
        let table = MemoryRuleTable::new();
        let gateway = MemoryGateway::new();

        let mut runner = runner(doc.clone(), &table, &gateway);
        let result = runner.run().await;

        assert_eq!(result.state, RunState::Done);
        assert_eq!(runner.state(), RunState::Done);
        assert!(result.applied);
        assert!(result.config_changed);
        assert!(result.errors.is_empty());
        assert_eq!(result.exit_code(), 0);
        assert!(result.backup_location.is_some());
        assert_eq!(gateway.saves(), vec![gateway_rules()]);
        let text = std::fs::read_to_string(&doc).unwrap();
        assert!(text.starts_with(SAMPLE_TORRC));
        assert!(text.contains("# BEGIN TOR-GATEWAY\nVirtualAddrNetwork"));
    }

    #[tokio::test]
    async fn test_preflight_denied_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        std::fs::write(&doc, SAMPLE_TORRC).unwrap();
        let table = MemoryRuleTable::new();
        let gateway = MemoryGateway::new();

        let mut runner = ReconcileRunner::new(
            plan(doc.clone()),
            Box::new(table.clone()),
            Box::new(gateway.clone()),
            Box::new(StaticPrivileges::denied("not root")),
        );
        let result = runner.run().await;

        assert_eq!(result.state, RunState::Failed);
        assert_eq!(result.exit_code(), 1);
        let fatal = result.fatal().unwrap();
        assert_eq!(fatal.stage, RunState::Preflight);
        assert_eq!(fatal.kind, ErrorKind::PermissionDenied);
        assert!(result.backup_location.is_none());
        assert_eq!(std::fs::read_to_string(&doc).unwrap(), SAMPLE_TORRC);
        assert_eq!(table.flush_calls(), 0);
    }

    #[tokio::test]
    async fn test_ambiguous_document_fails_before_rules() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        let broken = "# BEGIN TOR-GATEWAY\nA 1\n# BEGIN TOR-GATEWAY\n# END TOR-GATEWAY\n";
        std::fs::write(&doc, broken).unwrap();
        let table = MemoryRuleTable::new();
        let gateway = MemoryGateway::new();

        let result = runner(doc.clone(), &table, &gateway).run().await;

        assert_eq!(result.state, RunState::Failed);
        let fatal = result.fatal().unwrap();
        assert_eq!(fatal.stage, RunState::EditConfig);
        assert_eq!(fatal.kind, ErrorKind::AmbiguousBlock);
        // Backup ran, rules did not
        assert!(result.backup_location.is_some());
        assert_eq!(table.flush_calls(), 0);
        assert_eq!(std::fs::read_to_string(&doc).unwrap(), broken);
        assert!(gateway.saves().is_empty());
    }

    #[tokio::test]
    async fn test_partial_apply_fails_and_keeps_edit() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        std::fs::write(&doc, SAMPLE_TORRC).unwrap();
        let table = MemoryRuleTable::new();
        table.fail_append_containing("--syn", "iptables: Bad argument `--syn'");
        let gateway = MemoryGateway::new();

        let result = runner(doc.clone(), &table, &gateway).run().await;

        assert_eq!(result.state, RunState::Failed);
        assert!(!result.applied);
        assert_eq!(result.rules_applied, 1);
        let fatal = result.fatal().unwrap();
        assert_eq!(fatal.stage, RunState::ApplyRules);
        assert_eq!(fatal.kind, ErrorKind::PartialApply);
        let warnings: Vec<_> = result.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].stage, RunState::ApplyRules);
        assert!(warnings[0].message.contains("torgw restore"));
        // Never persist a half-applied rule set
        assert!(gateway.saves().is_empty());
        assert!(
            std::fs::read_to_string(&doc)
                .unwrap()
                .contains("# BEGIN TOR-GATEWAY")
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        let table = MemoryRuleTable::new();
        let gateway = MemoryGateway::failing("read-only file system");

        let result = runner(doc, &table, &gateway).run().await;

        assert_eq!(result.state, RunState::Done);
        assert_eq!(result.exit_code(), 0);
        let warnings: Vec<_> = result.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].stage, RunState::Persist);
        assert_eq!(warnings[0].kind, ErrorKind::PersistenceFailure);
        assert!(warnings[0].message.contains("read-only file system"));
    }

    #[tokio::test]
    async fn test_verification_mismatch_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        let table = MemoryRuleTable::new();
        table.drop_append_containing("--syn");
        let gateway = MemoryGateway::new();

        let result = runner(doc, &table, &gateway).run().await;

        assert_eq!(result.state, RunState::Done);
        let warnings: Vec<_> = result.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].stage, RunState::Verify);
        assert_eq!(warnings[0].kind, ErrorKind::VerificationMismatch);
        assert!(warnings[0].message.contains("- -t nat -A PREROUTING -i wlan0 -p tcp --syn"));
    }

    #[tokio::test]
    async fn test_missing_document_is_created_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        let table = MemoryRuleTable::new();
        let gateway = MemoryGateway::new();

        let result = runner(doc.clone(), &table, &gateway).run().await;

        assert!(result.is_done());
        assert!(result.backup_location.is_none());
        let expected: String = std::iter::once("# BEGIN TOR-GATEWAY".to_string())
            .chain(gateway_block())
            .chain(std::iter::once("# END TOR-GATEWAY".to_string()))
            .map(|l| l + "\n")
            .collect();
        assert_eq!(std::fs::read_to_string(&doc).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_second_run_leaves_document_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        std::fs::write(&doc, SAMPLE_TORRC).unwrap();
        let table = MemoryRuleTable::new();
        let gateway = MemoryGateway::new();

        let first = runner(doc.clone(), &table, &gateway).run().await;
        let after_first = std::fs::read_to_string(&doc).unwrap();
        let second = runner(doc.clone(), &table, &gateway).run().await;

        assert!(first.config_changed);
        assert!(!second.config_changed);
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(std::fs::read_to_string(&doc).unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_document_permissions_are_kept() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        std::fs::write(&doc, SAMPLE_TORRC).unwrap();
        std::fs::set_permissions(&doc, std::fs::Permissions::from_mode(0o640)).unwrap();

        let result = runner(doc.clone(), &MemoryRuleTable::new(), &MemoryGateway::new())
            .run()
            .await;

        assert!(result.is_done());
        assert_eq!(crate::utils::existing_mode(&doc).await, Some(0o640));
    }

    #[tokio::test]
    async fn test_run_is_audited_under_one_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        let audit = AuditLog::at(dir.path().join("audit.log"));

        let result = runner(doc, &MemoryRuleTable::new(), &MemoryGateway::new())
            .with_audit(audit.clone())
            .run()
            .await;

        let events = audit.read_recent(100).await.unwrap();
        let types: Vec<EventType> = events.iter().rev().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::Preflight,
                EventType::Backup,
                EventType::EditConfig,
                EventType::ApplyRules,
                EventType::PersistRules,
                EventType::VerifyRules,
                EventType::ReconcileFinished,
            ]
        );
        assert!(events.iter().all(|e| e.run_id == Some(result.run_id)));
    }

    #[test]
    fn test_result_serializes_states_in_snake_case() {
        let mut result = ReconcileResult::new(Uuid::nil());
        result.state = RunState::Failed;
        result.errors.push(ErrorRecord {
            stage: RunState::ApplyRules,
            kind: ErrorKind::PartialApply,
            severity: Severity::Fatal,
            message: "boom".to_string(),
        });
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["errors"][0]["stage"], "apply_rules");
        assert_eq!(json["errors"][0]["severity"], "fatal");
    }
}
