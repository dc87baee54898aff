//! Session & artifact store (`spec.md` C3): in-memory session state guarded
//! by a single mutex, snapshotted to disk as JSON after every transition.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use qpo_core::{LastStage, PipelineError, StageKind, TerminationReason};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// One entry in a session's stage history (`spec.md` §3: "report path,
/// summary counts (issues_found / fixes_applied / fixes_failed /
/// remaining_issues as applicable)... and optional error message").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub kind: StageKind,
    pub cycle: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub report_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub issues_found: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fixes_applied: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fixes_failed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remaining_issues: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// What a finished stage reported back to the store, via [`SessionStore::end_stage`].
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub exit_code: i32,
    pub report_path: Option<PathBuf>,
    pub issues_found: u64,
    pub fixes_applied: u64,
    pub fixes_failed: u64,
    /// The freshest issue count, if this stage measured one. Per `spec.md`
    /// §4.6's "validation scan wins" policy, a `Validating` stage's count
    /// always overwrites `Metrics::remaining_issues`, never the patcher's
    /// self-reported estimate.
    pub remaining_issues: Option<u64>,
}

/// Running counters across a session's lifetime (`spec.md` §3 Metrics).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub scans_run: u32,
    pub fixes_run: u32,
    pub issues_found_total: u64,
    pub issues_fixed_total: u64,
    pub remaining_issues: u64,
    pub cycles_executed: u32,
    pub wall_time_ms: u64,
}

/// A single orchestration session: one workspace, one run-to-completion
/// lifecycle (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub workspace_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cycle: u32,
    pub last_stage: LastStage,
    #[serde(skip)]
    pub running_stage: Option<StageKind>,
    pub history: Vec<StageRecord>,
    pub metrics: Metrics,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_scan_report_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_fix_report_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub termination: Option<String>,
}

impl Session {
    fn new(id: String, workspace_root: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            workspace_root,
            created_at: now,
            updated_at: now,
            cycle: 0,
            last_stage: LastStage::None,
            running_stage: None,
            history: Vec::new(),
            metrics: Metrics::default(),
            last_scan_report_path: None,
            last_fix_report_path: None,
            termination: None,
        }
    }

    fn session_file(&self, session_dir: &Path) -> PathBuf {
        session_dir.join("session.json")
    }
}

/// Thread-safe store of live sessions, keyed by session id.
///
/// Mirrors the lease-pool shape used elsewhere in this workspace for
/// concurrent stateful pools: a single `Mutex` guarding a `HashMap`, with
/// all mutation going through short-lived lock scopes.
pub struct SessionStore {
    inner: Mutex<HashMap<String, Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn get_or_create(&self, id: &str, workspace_root: &Path) -> Session {
        let mut guard = self.inner.lock().await;
        guard
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id.to_string(), workspace_root.to_path_buf()))
            .clone()
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.inner.lock().await.get(id).cloned()
    }

    /// Begin a stage, bumping `cycle` when a new `Scanning` stage starts a
    /// fresh scan/fix/validate cycle. Rejects a second concurrent stage on
    /// the same session (`spec.md` invariant: single running stage).
    pub async fn begin_stage(&self, id: &str, kind: StageKind) -> Result<u32, PipelineError> {
        let mut guard = self.inner.lock().await;
        let session = guard
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;

        if session.running_stage.is_some() {
            return Err(PipelineError::Conflict(id.to_string()));
        }

        if kind == StageKind::Scanning
            && (session.last_stage == LastStage::Validating || session.last_stage == LastStage::None)
        {
            session.cycle += 1;
        }

        session.running_stage = Some(kind);
        session.last_stage = match kind {
            StageKind::Scanning => LastStage::Scanning,
            StageKind::Fixing => LastStage::Fixing,
            StageKind::Validating => LastStage::Validating,
        };
        session.history.push(StageRecord {
            kind,
            cycle: session.cycle,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            report_path: None,
            issues_found: None,
            fixes_applied: None,
            fixes_failed: None,
            remaining_issues: None,
            error: None,
        });
        session.metrics.cycles_executed = session.cycle;
        session.updated_at = Utc::now();
        Ok(session.cycle)
    }

    /// Close out the currently running stage with its exit code and
    /// results, updating counters. Does not itself decide termination; the
    /// orchestrator calls [`SessionStore::finish`] once it knows the
    /// pipeline's overall fate.
    pub async fn end_stage(&self, id: &str, outcome: StageOutcome) -> Result<(), PipelineError> {
        let mut guard = self.inner.lock().await;
        let session = guard
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;

        let Some(kind) = session.running_stage.take() else {
            return Err(PipelineError::Conflict(format!(
                "no stage is running for session '{id}'"
            )));
        };

        if let Some(record) = session.history.iter_mut().rev().find(|r| r.ended_at.is_none()) {
            record.ended_at = Some(Utc::now());
            record.exit_code = Some(outcome.exit_code);
            record.report_path = outcome.report_path.clone();
            record.issues_found = Some(outcome.issues_found);
            record.fixes_applied = Some(outcome.fixes_applied);
            record.fixes_failed = Some(outcome.fixes_failed);
            record.remaining_issues = outcome.remaining_issues;
        }

        match kind {
            StageKind::Scanning | StageKind::Validating => {
                session.metrics.scans_run += 1;
                session.last_scan_report_path = outcome.report_path.clone().or(session.last_scan_report_path.clone());
            }
            StageKind::Fixing => {
                session.metrics.fixes_run += 1;
                session.last_fix_report_path = outcome.report_path.clone().or(session.last_fix_report_path.clone());
            }
        }
        session.metrics.issues_found_total += outcome.issues_found;
        session.metrics.issues_fixed_total += outcome.fixes_applied;
        if let Some(remaining) = outcome.remaining_issues {
            session.metrics.remaining_issues = remaining;
        }
        session.metrics.wall_time_ms = wall_time_ms(session.created_at);
        session.updated_at = Utc::now();
        Ok(())
    }

    /// Close out the currently running stage with an error message instead
    /// of a normal exit, so a hard failure doesn't leave the session stuck
    /// believing a stage is still running.
    pub async fn fail_stage(&self, id: &str, error: String) -> Result<(), PipelineError> {
        let mut guard = self.inner.lock().await;
        let session = guard
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        session.running_stage = None;
        if let Some(record) = session.history.iter_mut().rev().find(|r| r.ended_at.is_none()) {
            record.ended_at = Some(Utc::now());
            record.error = Some(error);
        }
        session.metrics.wall_time_ms = wall_time_ms(session.created_at);
        session.updated_at = Utc::now();
        Ok(())
    }

    /// Mark a session as terminally done, recording why (`spec.md` §4.6
    /// termination reasons). A session cannot reach `Done` without a
    /// `TerminationReason`; this is the only place `last_stage` becomes
    /// `Done` or `Failed`.
    pub async fn finish(&self, id: &str, reason: &TerminationReason) -> Result<(), PipelineError> {
        let mut guard = self.inner.lock().await;
        let session = guard
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        session.last_stage = match reason {
            TerminationReason::Failed(_) => LastStage::Failed,
            TerminationReason::ZeroIssues | TerminationReason::BudgetExhausted => LastStage::Done,
        };
        session.termination = Some(reason.to_string());
        session.metrics.wall_time_ms = wall_time_ms(session.created_at);
        session.updated_at = Utc::now();
        Ok(())
    }

    pub async fn snapshot(&self, id: &str) -> Option<Session> {
        self.get(id).await
    }

    /// Write the session's current state to `<session_dir>/session.json`
    /// atomically (write-then-rename, same idiom as report files).
    pub async fn persist(&self, id: &str, session_dir: &Path) -> Result<(), PipelineError> {
        let Some(session) = self.get(id).await else {
            return Err(PipelineError::NotFound(id.to_string()));
        };
        let path = session.session_file(session_dir);
        let tmp_path = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&session)
            .map_err(|e| PipelineError::Internal(format!("failed to serialize session: {e}")))?;
        std::fs::write(&tmp_path, body)
            .map_err(|e| PipelineError::Internal(format!("failed to write session snapshot: {e}")))?;
        std::fs::rename(&tmp_path, &path)
            .map_err(|e| PipelineError::Internal(format!("failed to rename session snapshot: {e}")))?;
        Ok(())
    }
}

fn wall_time_ms(created_at: DateTime<Utc>) -> u64 {
    (Utc::now() - created_at).num_milliseconds().max(0) as u64
}

/// Generate a default session id in the `pipeline_<unix_nanos>` shape
/// `spec.md` §3 specifies for caller-omitted session ids.
pub fn new_session_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("pipeline_{nanos}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_stage_rejects_concurrent_stage() {
        let store = SessionStore::new();
        store.get_or_create("s1", Path::new("/tmp")).await;
        store.begin_stage("s1", StageKind::Scanning).await.unwrap();
        let err = store.begin_stage("s1", StageKind::Fixing).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }

    fn outcome(exit_code: i32, issues_found: u64, fixes_applied: u64) -> StageOutcome {
        StageOutcome {
            exit_code,
            issues_found,
            fixes_applied,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cycle_increments_on_fresh_scan_not_on_validation() {
        let store = SessionStore::new();
        store.get_or_create("s1", Path::new("/tmp")).await;
        let c1 = store.begin_stage("s1", StageKind::Scanning).await.unwrap();
        store.end_stage("s1", outcome(0, 5, 0)).await.unwrap();
        store.begin_stage("s1", StageKind::Fixing).await.unwrap();
        store.end_stage("s1", outcome(0, 0, 3)).await.unwrap();
        let c2 = store.begin_stage("s1", StageKind::Validating).await.unwrap();
        assert_eq!(c1, c2);
        store.end_stage("s1", outcome(0, 2, 0)).await.unwrap();

        let c3 = store.begin_stage("s1", StageKind::Scanning).await.unwrap();
        assert_eq!(c3, c1 + 1);
    }

    #[tokio::test]
    async fn finish_sets_done_on_zero_issues() {
        let store = SessionStore::new();
        store.get_or_create("s1", Path::new("/tmp")).await;
        store.finish("s1", &TerminationReason::ZeroIssues).await.unwrap();
        let session = store.get("s1").await.unwrap();
        assert_eq!(session.last_stage, LastStage::Done);
        assert_eq!(session.termination.as_deref(), Some("zero_issues"));
    }

    #[tokio::test]
    async fn finish_sets_failed_on_failure_reason() {
        let store = SessionStore::new();
        store.get_or_create("s1", Path::new("/tmp")).await;
        store
            .finish("s1", &TerminationReason::Failed("fix".into()))
            .await
            .unwrap();
        let session = store.get("s1").await.unwrap();
        assert_eq!(session.last_stage, LastStage::Failed);
    }

    #[tokio::test]
    async fn end_stage_without_begin_is_conflict() {
        let store = SessionStore::new();
        store.get_or_create("s1", Path::new("/tmp")).await;
        let err = store.end_stage("s1", StageOutcome::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }

    #[tokio::test]
    async fn fail_stage_clears_running_stage_and_records_error() {
        let store = SessionStore::new();
        store.get_or_create("s1", Path::new("/tmp")).await;
        store.begin_stage("s1", StageKind::Scanning).await.unwrap();
        store.fail_stage("s1", "scanner exited 2".into()).await.unwrap();
        // A second stage can now begin -- the failed stage didn't leave
        // `running_stage` stuck.
        store.begin_stage("s1", StageKind::Scanning).await.unwrap();
        let session = store.get("s1").await.unwrap();
        let first = &session.history[0];
        assert!(first.ended_at.is_some());
        assert_eq!(first.error.as_deref(), Some("scanner exited 2"));
    }

    #[tokio::test]
    async fn end_stage_records_report_path_and_remaining_issues() {
        let store = SessionStore::new();
        store.get_or_create("s1", Path::new("/tmp")).await;
        store.begin_stage("s1", StageKind::Validating).await.unwrap();
        store
            .end_stage(
                "s1",
                StageOutcome {
                    exit_code: 0,
                    report_path: Some(PathBuf::from("/tmp/lint-report.json")),
                    issues_found: 4,
                    remaining_issues: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let session = store.get("s1").await.unwrap();
        assert_eq!(session.metrics.remaining_issues, 4);
        assert_eq!(
            session.last_scan_report_path,
            Some(PathBuf::from("/tmp/lint-report.json"))
        );
        assert_eq!(session.history[0].remaining_issues, Some(4));
    }

    #[tokio::test]
    async fn persist_writes_session_json() {
        let store = SessionStore::new();
        let tmp = tempfile::tempdir().unwrap();
        store.get_or_create("s1", tmp.path()).await;
        store.persist("s1", tmp.path()).await.unwrap();
        assert!(tmp.path().join("session.json").is_file());
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }
}
