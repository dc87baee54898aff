//! The `rmcp` stdio tool server. Six tools, one shared [`SessionStore`], a
//! semaphore gating concurrent subprocess spawns workspace-wide.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use qpo_adapters::{stderr_log_path, AdapterContext, FixOptions, ScanOptions};
use qpo_config::{ResolveParams, ResolvedConfig};
use qpo_core::{PipelineError, StageKind, TerminationReason};
use qpo_pipeline::{run_full, RunFullOptions};
use qpo_session::{new_session_id, SessionStore, StageOutcome};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, ServerCapabilities, ServerInfo};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError};
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::envelope::Envelope;
use crate::params::{FixParams, RunFullParams, ScanParams, StatusParams, WorkflowTriggerParams};

/// Options fixed at server startup, not per tool-call: the workspace root
/// and whatever overrides came from CLI flags, `.mcp-server-config.json`,
/// or the environment. Each tool call still re-resolves a full
/// [`ResolvedConfig`] per session id, since the session directory is
/// session-scoped, but these inputs to that resolution are shared.
#[derive(Debug, Clone, Default)]
pub struct QpoServerConfig {
    pub workspace_root: Option<PathBuf>,
    pub interpreter: Option<String>,
    pub scanner_cmd: Option<Vec<String>>,
    pub patcher_cmd: Option<Vec<String>>,
    pub scan_timeout_s: Option<u64>,
    pub fix_timeout_s: Option<u64>,
    pub max_concurrent_subprocesses: Option<usize>,
    /// `gh` (or equivalent) binary used by `github_workflow_trigger`.
    pub workflow_trigger_cmd: Option<String>,
}

#[derive(Clone)]
pub struct QpoServer {
    base: QpoServerConfig,
    store: Arc<SessionStore>,
    subprocess_permits: Arc<Semaphore>,
    tool_router: ToolRouter<Self>,
}

const TOOL_NAMES: &[&str] = &[
    "version_keeper_scan",
    "quality_patcher_fix",
    "pipeline_run_full",
    "github_workflow_trigger",
    "pipeline_status",
    "mcp_compliance_check",
];

impl QpoServer {
    pub fn new(base: QpoServerConfig) -> Self {
        let max_concurrent = base.max_concurrent_subprocesses.unwrap_or(8);
        Self {
            base,
            store: SessionStore::shared(),
            subprocess_permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tool_router: Self::tool_router(),
        }
    }

    fn resolve(&self, session_id: &str) -> Result<ResolvedConfig, PipelineError> {
        let params = ResolveParams {
            workspace_root: self.base.workspace_root.clone(),
            session_id: session_id.to_string(),
            interpreter: self.base.interpreter.clone(),
            scanner_cmd: self.base.scanner_cmd.clone(),
            patcher_cmd: self.base.patcher_cmd.clone(),
            scan_timeout_s: self.base.scan_timeout_s,
            fix_timeout_s: self.base.fix_timeout_s,
            max_concurrent_subprocesses: self.base.max_concurrent_subprocesses,
        };
        qpo_config::resolve(&params)
    }

    fn adapter_ctx(resolved: &ResolvedConfig) -> AdapterContext {
        AdapterContext {
            interpreter: resolved.interpreter.clone(),
            scanner_cmd: resolved.scanner_cmd.clone(),
            patcher_cmd: resolved.patcher_cmd.clone(),
            workspace_root: resolved.workspace_root.clone(),
        }
    }

    async fn finish_failed(&self, session_id: &str, stage: &str, error: &PipelineError) {
        if let Err(e) = self.store.fail_stage(session_id, error.to_string()).await {
            warn!(session_id, error = %e, "failed to record stage failure");
        }
        if let Err(e) = self
            .store
            .finish(session_id, &TerminationReason::Failed(stage.to_string()))
            .await
        {
            warn!(session_id, error = %e, "failed to record session failure");
        }
    }

    /// For a `run_full` call that failed, recover which sub-stage (`scan` /
    /// `fix` / `validate`) actually failed from the session's recorded
    /// termination reason, so the error envelope's `stderr_path` points at
    /// that stage's captured stderr rather than a nonexistent
    /// `run_full-stderr.log`. `validate` is implemented as a second `scan`
    /// call (`spec.md` §4.6), so it shares the scan adapter's stderr log.
    async fn failing_substage(&self, session_id: &str) -> String {
        let stage = match self.store.get(session_id).await.and_then(|s| s.termination) {
            Some(reason) => reason.strip_prefix("failed: ").unwrap_or("run_full").to_string(),
            None => "run_full".to_string(),
        };
        match stage.as_str() {
            "validate" | "validating" => "scan".to_string(),
            other => other.to_string(),
        }
    }

    async fn session_snapshot_json(&self, session_id: &str) -> serde_json::Value {
        match self.store.snapshot(session_id).await {
            Some(session) => serde_json::to_value(session).unwrap_or(serde_json::Value::Null),
            None => serde_json::Value::Null,
        }
    }

    async fn do_scan(&self, session_id: &str, p: &ScanParams) -> Result<serde_json::Value, PipelineError> {
        let resolved = self.resolve(session_id)?;
        self.store
            .get_or_create(session_id, &resolved.workspace_root)
            .await;
        let cycle = self.store.begin_stage(session_id, StageKind::Scanning).await?;

        let _permit = self.subprocess_permits.acquire().await.expect("semaphore is never closed");
        let ctx = Self::adapter_ctx(&resolved);
        let opts = ScanOptions {
            comprehensive: p.comprehensive.unwrap_or(true),
            extra_args: Vec::new(),
        };
        let result = qpo_adapters::run_scan(
            &ctx,
            &resolved.session_dir,
            &resolved.reports_dir,
            cycle,
            resolved.scan_timeout,
            &opts,
        )
        .await;
        drop(_permit);

        match result {
            Ok((report, lint_report_path)) => {
                self.store
                    .end_stage(
                        session_id,
                        StageOutcome {
                            exit_code: 0,
                            report_path: Some(lint_report_path),
                            issues_found: report.summary.total,
                            remaining_issues: Some(report.summary.total),
                            ..Default::default()
                        },
                    )
                    .await?;
                if report.summary.total == 0 {
                    self.store
                        .finish(session_id, &TerminationReason::ZeroIssues)
                        .await?;
                }
                let _ = self.store.persist(session_id, &resolved.session_dir).await;
                Ok(json!({
                    "lint_report": report,
                    "session": self.session_snapshot_json(session_id).await,
                }))
            }
            Err(e) => {
                self.finish_failed(session_id, "scan", &e).await;
                let _ = self.store.persist(session_id, &resolved.session_dir).await;
                Err(e)
            }
        }
    }

    async fn do_fix(&self, session_id: &str, p: &FixParams) -> Result<serde_json::Value, PipelineError> {
        let resolved = self.resolve(session_id)?;
        self.store
            .get_or_create(session_id, &resolved.workspace_root)
            .await;
        let lint_report_path = match self.store.get(session_id).await.and_then(|s| s.last_scan_report_path) {
            Some(path) => path,
            None => {
                return Err(PipelineError::InvalidRequest(format!(
                    "session '{session_id}' has no prior scan report; run scan before fix"
                )));
            }
        };
        let cycle = self.store.begin_stage(session_id, StageKind::Fixing).await?;

        let _permit = self.subprocess_permits.acquire().await.expect("semaphore is never closed");
        let ctx = Self::adapter_ctx(&resolved);
        let opts = FixOptions {
            max_fixes: p.max_fixes.unwrap_or(10),
            auto_apply: p.auto_apply.unwrap_or(true),
            claude_agent: p.claude_agent.unwrap_or(true),
        };
        let result = qpo_adapters::run_fix(
            &ctx,
            &resolved.session_dir,
            &resolved.reports_dir,
            cycle,
            &lint_report_path,
            resolved.fix_timeout,
            &opts,
        )
        .await;
        drop(_permit);

        match result {
            Ok((report, fix_report_path)) => {
                self.store
                    .end_stage(
                        session_id,
                        StageOutcome {
                            exit_code: 0,
                            report_path: Some(fix_report_path),
                            fixes_applied: report.applied_count,
                            remaining_issues: Some(report.remaining),
                            ..Default::default()
                        },
                    )
                    .await?;
                let _ = self.store.persist(session_id, &resolved.session_dir).await;
                Ok(json!({
                    "fix_report": report,
                    "session": self.session_snapshot_json(session_id).await,
                    "warnings": report.warnings,
                }))
            }
            Err(e) => {
                self.finish_failed(session_id, "fix", &e).await;
                let _ = self.store.persist(session_id, &resolved.session_dir).await;
                Err(e)
            }
        }
    }

    async fn do_run_full(&self, session_id: &str, p: &RunFullParams) -> Result<serde_json::Value, PipelineError> {
        let resolved = self.resolve(session_id)?;
        self.store
            .get_or_create(session_id, &resolved.workspace_root)
            .await;

        let ctx = Self::adapter_ctx(&resolved);
        let scanner = qpo_pipeline::RealScanner {
            ctx: ctx.clone(),
            timeout: resolved.scan_timeout,
        };
        let patcher = qpo_pipeline::RealPatcher {
            ctx,
            timeout: resolved.fix_timeout,
            auto_apply: true,
            claude_agent: true,
        };
        let opts = RunFullOptions {
            max_cycles: p.max_cycles.unwrap_or(10),
            max_fixes_per_cycle: p.max_fixes_per_cycle.unwrap_or(10),
            break_on_no_issues: p.break_on_no_issues.unwrap_or(true),
            comprehensive: p.comprehensive.unwrap_or(true),
        };

        let _permit = self.subprocess_permits.acquire().await.expect("semaphore is never closed");
        let result = run_full(
            &self.store,
            &scanner,
            &patcher,
            &resolved.session_dir,
            &resolved.reports_dir,
            session_id,
            &opts,
        )
        .await;
        drop(_permit);
        let _ = self.store.persist(session_id, &resolved.session_dir).await;

        result.map(|r| {
            json!({
                "session_id": r.session_id,
                "cycles_executed": r.cycles_run,
                "termination_reason": r.termination_reason.to_string(),
                "success": !matches!(r.termination_reason, TerminationReason::Failed(_)),
                "total_issues_found": r.total_issues_found,
                "total_issues_fixed": r.total_issues_fixed,
                "final_issue_count": r.final_issue_count,
                "session": serde_json::Value::Null, // filled in below by caller via snapshot
            })
        })
    }

    async fn do_workflow_trigger(&self, p: &WorkflowTriggerParams) -> Result<serde_json::Value, PipelineError> {
        let cmd = self
            .base
            .workflow_trigger_cmd
            .clone()
            .unwrap_or_else(|| "gh".to_string());
        let mut args = vec!["workflow".to_string(), "run".to_string(), p.workflow.clone()];
        if let Some(ref git_ref) = p.git_ref {
            args.push("--ref".to_string());
            args.push(git_ref.clone());
        }
        if let Some(ref inputs) = p.inputs {
            for (key, value) in inputs {
                let value_str = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                args.push("--field".to_string());
                args.push(format!("{key}={value_str}"));
            }
        }

        let workspace_root = self
            .base
            .workspace_root
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let mut run_opts = qpo_process::RunOptions::new(cmd, args, Duration::from_secs(120));
        run_opts.cwd = Some(workspace_root);

        let _permit = self.subprocess_permits.acquire().await.expect("semaphore is never closed");
        let outcome = qpo_process::run(run_opts).await?;
        Ok(json!({
            "exit_code": outcome.exit_code,
            "stdout": outcome.stdout,
            "stderr": outcome.stderr,
        }))
    }
}

#[tool_router]
impl QpoServer {
    #[tool(
        description = "Run the version-keeper scanner against the workspace and return its lint report."
    )]
    async fn version_keeper_scan(
        &self,
        Parameters(p): Parameters<ScanParams>,
    ) -> Result<CallToolResult, McpError> {
        let started = Instant::now();
        let session_id = p.session_id.clone().unwrap_or_else(new_session_id);
        let result = self.do_scan(&session_id, &p).await;
        Ok(self.envelope(
            "version_keeper_scan",
            Some(session_id),
            started,
            result,
            "scan",
        ))
    }

    #[tool(description = "Invoke the quality-patcher to fix issues from the latest lint report.")]
    async fn quality_patcher_fix(
        &self,
        Parameters(p): Parameters<FixParams>,
    ) -> Result<CallToolResult, McpError> {
        let started = Instant::now();
        let session_id = p.session_id.clone().unwrap_or_else(new_session_id);
        let result = self.do_fix(&session_id, &p).await;
        Ok(self.envelope(
            "quality_patcher_fix",
            Some(session_id),
            started,
            result,
            "fix",
        ))
    }

    #[tool(
        description = "Drive the full scan -> fix -> validate cycle machine to zero issues or budget exhaustion."
    )]
    async fn pipeline_run_full(
        &self,
        Parameters(p): Parameters<RunFullParams>,
    ) -> Result<CallToolResult, McpError> {
        let started = Instant::now();
        let session_id = p.session_id.clone().unwrap_or_else(new_session_id);
        let mut result = self.do_run_full(&session_id, &p).await;
        let stage = if result.is_ok() {
            "run_full".to_string()
        } else {
            self.failing_substage(&session_id).await
        };
        if let Ok(ref mut value) = result {
            value["session"] = self.session_snapshot_json(&session_id).await;
        }
        Ok(self.envelope("pipeline_run_full", Some(session_id), started, result, &stage))
    }

    #[tool(description = "Dispatch a GitHub Actions workflow_dispatch run (thin subprocess passthrough).")]
    async fn github_workflow_trigger(
        &self,
        Parameters(p): Parameters<WorkflowTriggerParams>,
    ) -> Result<CallToolResult, McpError> {
        let started = Instant::now();
        let result = self.do_workflow_trigger(&p).await;
        Ok(self.envelope("github_workflow_trigger", None, started, result, "workflow"))
    }

    #[tool(description = "Return the current snapshot of a session: cycle, last stage, metrics, history.")]
    async fn pipeline_status(
        &self,
        Parameters(p): Parameters<StatusParams>,
    ) -> Result<CallToolResult, McpError> {
        let started = Instant::now();
        let result = match self.store.get(&p.session_id).await {
            Some(session) => Ok(json!({ "session": session })),
            None => Err(PipelineError::NotFound(p.session_id.clone())),
        };
        Ok(self.envelope(
            "pipeline_status",
            Some(p.session_id.clone()),
            started,
            result,
            "status",
        ))
    }

    #[tool(description = "Static introspection of this server's MCP feature set; never mutates state.")]
    async fn mcp_compliance_check(&self) -> Result<CallToolResult, McpError> {
        let started = Instant::now();
        let result: Result<serde_json::Value, PipelineError> = Ok(json!({
            "tools": TOOL_NAMES,
            "features": {
                "structured_errors": true,
                "session_concurrency": true,
                "json_reports": true,
            },
            "version": env!("CARGO_PKG_VERSION"),
        }));
        Ok(self.envelope(
            "mcp_compliance_check",
            None,
            started,
            result,
            "compliance",
        ))
    }
}

impl QpoServer {
    /// Turn an adapter/orchestrator result into the response envelope,
    /// wrapped as a single `TextContent` item. Hard failures additionally
    /// set `CallToolResult::is_error` so the transport-level outcome
    /// matches the envelope's `status` field.
    fn envelope(
        &self,
        tool: &'static str,
        session_id: Option<String>,
        started: Instant,
        result: Result<serde_json::Value, PipelineError>,
        stage: &str,
    ) -> CallToolResult {
        let elapsed = started.elapsed().as_millis();
        match result {
            Ok(results) => {
                let envelope = Envelope::success(tool, session_id, elapsed, results);
                CallToolResult::success(vec![Content::text(envelope.to_text())])
            }
            Err(err) => {
                info!(tool, error = %err, "tool call failed");
                let stderr_path = session_id.as_ref().and_then(|id| {
                    let dir = self
                        .base
                        .workspace_root
                        .clone()
                        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
                        .join("pipeline-sessions")
                        .join(id);
                    let path = stderr_log_path(&dir, stage);
                    path.exists().then(|| path.display().to_string())
                });
                let envelope = Envelope::error(tool, session_id, elapsed, &err, stderr_path);
                CallToolResult::error(vec![Content::text(envelope.to_text())])
            }
        }
    }
}

#[tool_handler]
impl rmcp::ServerHandler for QpoServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Quality pipeline orchestrator: scans a workspace with a linter, applies fixes \
                 via a patcher agent, and re-validates until clean or budget-exhausted. Start \
                 with pipeline_run_full for a full cycle, or drive version_keeper_scan / \
                 quality_patcher_fix individually for finer control."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Serve `server` on stdio until the client disconnects or sends shutdown.
pub async fn serve_stdio(server: QpoServer) -> anyhow::Result<()> {
    use rmcp::transport::stdio;
    use rmcp::ServiceExt;

    info!("starting qpo MCP server on stdio");
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    info!("qpo MCP server shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A workspace wired with `sh -c` fakes standing in for the scanner and
    /// patcher, mirroring `qpo-adapters`' own test fakes: each reads its
    /// `--output-file` argument and writes a fixed report there rather than
    /// doing any real scanning.
    fn fake_workspace(scan_json: &str, fix_json: &str) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let scan_script = format!(
            "for a in \"$@\"; do shift; case \"$a\" in --output-file) out=\"$1\";; esac; done; echo '{scan_json}' > \"$out\""
        );
        let fix_script = format!(
            "for a in \"$@\"; do shift; case \"$a\" in --output-file) out=\"$1\";; esac; done; echo '{fix_json}' > \"$out\""
        );
        std::fs::write(tmp.path().join("scanner.sh"), scan_script).unwrap();
        std::fs::write(tmp.path().join("patcher.sh"), fix_script).unwrap();
        tmp
    }

    fn server_for(tmp: &tempfile::TempDir) -> QpoServer {
        QpoServer::new(QpoServerConfig {
            workspace_root: Some(tmp.path().to_path_buf()),
            interpreter: Some("sh".to_string()),
            scanner_cmd: Some(vec!["scanner.sh".to_string()]),
            patcher_cmd: Some(vec!["patcher.sh".to_string()]),
            ..Default::default()
        })
    }

    fn empty_lint_report() -> String {
        serde_json::json!({
            "schema_version": 1,
            "generated_at": chrono::Utc::now(),
            "issues": [],
            "summary": {"total": 0, "by_severity": {}},
        })
        .to_string()
    }

    fn one_issue_lint_report() -> String {
        serde_json::json!({
            "schema_version": 1,
            "generated_at": chrono::Utc::now(),
            "issues": [{"file": "a.rs", "line": 1, "severity": "warning", "rule": "x", "message": "y"}],
            "summary": {"total": 1, "by_severity": {"warning": 1}},
        })
        .to_string()
    }

    fn fix_report(applied: u64, remaining: u64) -> String {
        serde_json::json!({
            "schema_version": 1,
            "generated_at": chrono::Utc::now(),
            "fixed": [],
            "applied_count": applied,
            "remaining": remaining,
            "partial": false,
            "warnings": [],
        })
        .to_string()
    }

    #[tokio::test]
    async fn version_keeper_scan_tool_reports_zero_issues() {
        let tmp = fake_workspace(&empty_lint_report(), &fix_report(0, 0));
        let server = server_for(&tmp);
        let result = server
            .version_keeper_scan(Parameters(ScanParams::default()))
            .await
            .unwrap();
        assert!(!result.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn pipeline_status_on_unknown_session_is_not_found_error() {
        let tmp = tempfile::tempdir().unwrap();
        let server = server_for(&tmp);
        let result = server
            .pipeline_status(Parameters(StatusParams {
                session_id: "nonexistent".to_string(),
            }))
            .await
            .unwrap();
        assert!(result.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn mcp_compliance_check_lists_all_six_tools() {
        let tmp = tempfile::tempdir().unwrap();
        let server = server_for(&tmp);
        let result = server.mcp_compliance_check().await.unwrap();
        assert!(!result.is_error.unwrap_or(false));
        assert_eq!(TOOL_NAMES.len(), 6);
    }

    #[tokio::test]
    async fn version_keeper_scan_then_fix_round_trips_through_session_store() {
        let tmp = fake_workspace(&one_issue_lint_report(), &fix_report(1, 0));
        let server = server_for(&tmp);
        let scan = server
            .version_keeper_scan(Parameters(ScanParams {
                session_id: Some("s1".to_string()),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert!(!scan.is_error.unwrap_or(false));

        let fix = server
            .quality_patcher_fix(Parameters(FixParams {
                session_id: Some("s1".to_string()),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert!(!fix.is_error.unwrap_or(false));

        let session = server.store.get("s1").await.unwrap();
        assert_eq!(session.metrics.issues_found_total, 1);
        assert_eq!(session.metrics.issues_fixed_total, 1);
    }
}
