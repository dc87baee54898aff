use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use qpo_adapters::{AdapterContext, FixOptions, ScanOptions};
use qpo_config::ResolveParams;
use qpo_core::PipelineError;
use qpo_pipeline::{run_full, RealPatcher, RealScanner, RunFullOptions};
use qpo_session::{new_session_id, SessionStore, StageOutcome};

mod cli;
#[cfg(test)]
mod cli_tests;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let workspace_root = cli.workspace.clone().map(PathBuf::from);

    let outcome = run(cli.command, workspace_root).await;
    match outcome {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("error: {e}");
            let code = e
                .downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

async fn run(command: Commands, workspace_root: Option<PathBuf>) -> Result<()> {
    match command {
        Commands::Scan { session, no_comprehensive } => {
            let session_id = session.unwrap_or_else(new_session_id);
            let resolved = qpo_config::resolve(&ResolveParams {
                workspace_root,
                session_id: session_id.clone(),
                ..Default::default()
            })
            .map_err(anyhow::Error::from)?;

            let store = SessionStore::shared();
            store.get_or_create(&session_id, &resolved.workspace_root).await;
            let cycle = store.begin_stage(&session_id, qpo_core::StageKind::Scanning).await?;

            let ctx = AdapterContext {
                interpreter: resolved.interpreter.clone(),
                scanner_cmd: resolved.scanner_cmd.clone(),
                patcher_cmd: resolved.patcher_cmd.clone(),
                workspace_root: resolved.workspace_root.clone(),
            };
            let opts = ScanOptions {
                comprehensive: !no_comprehensive,
                extra_args: Vec::new(),
            };
            let (report, lint_report_path) = qpo_adapters::run_scan(
                &ctx,
                &resolved.session_dir,
                &resolved.reports_dir,
                cycle,
                resolved.scan_timeout,
                &opts,
            )
            .await
            .map_err(anyhow::Error::from)?;
            store
                .end_stage(
                    &session_id,
                    StageOutcome {
                        exit_code: 0,
                        report_path: Some(lint_report_path),
                        issues_found: report.summary.total,
                        remaining_issues: Some(report.summary.total),
                        ..Default::default()
                    },
                )
                .await?;
            store.persist(&session_id, &resolved.session_dir).await?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Fix {
            session,
            max_fixes,
            no_auto_apply,
            no_claude_agent,
        } => {
            let session_id = session.unwrap_or_else(new_session_id);
            let resolved = qpo_config::resolve(&ResolveParams {
                workspace_root,
                session_id: session_id.clone(),
                ..Default::default()
            })
            .map_err(anyhow::Error::from)?;

            let store = SessionStore::shared();
            store.get_or_create(&session_id, &resolved.workspace_root).await;
            let lint_report_path = match store.get(&session_id).await.and_then(|s| s.last_scan_report_path) {
                Some(path) => path,
                None => {
                    return Err(anyhow::Error::from(PipelineError::InvalidRequest(format!(
                        "session '{session_id}' has no prior scan report; run scan before fix"
                    ))));
                }
            };
            let cycle = store.begin_stage(&session_id, qpo_core::StageKind::Fixing).await?;

            let ctx = AdapterContext {
                interpreter: resolved.interpreter.clone(),
                scanner_cmd: resolved.scanner_cmd.clone(),
                patcher_cmd: resolved.patcher_cmd.clone(),
                workspace_root: resolved.workspace_root.clone(),
            };
            let opts = FixOptions {
                max_fixes,
                auto_apply: !no_auto_apply,
                claude_agent: !no_claude_agent,
            };
            let (report, fix_report_path) = qpo_adapters::run_fix(
                &ctx,
                &resolved.session_dir,
                &resolved.reports_dir,
                cycle,
                &lint_report_path,
                resolved.fix_timeout,
                &opts,
            )
            .await
            .map_err(anyhow::Error::from)?;
            store
                .end_stage(
                    &session_id,
                    StageOutcome {
                        exit_code: 0,
                        report_path: Some(fix_report_path),
                        fixes_applied: report.applied_count,
                        remaining_issues: Some(report.remaining),
                        ..Default::default()
                    },
                )
                .await?;
            store.persist(&session_id, &resolved.session_dir).await?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.partial {
                for warning in &report.warnings {
                    eprintln!("warning: {warning}");
                }
            }
            Ok(())
        }
        Commands::RunFull {
            session,
            max_cycles,
            max_fixes_per_cycle,
            no_break_on_no_issues,
            no_comprehensive,
        } => {
            let session_id = session.unwrap_or_else(new_session_id);
            let resolved = qpo_config::resolve(&ResolveParams {
                workspace_root,
                session_id: session_id.clone(),
                ..Default::default()
            })
            .map_err(anyhow::Error::from)?;

            let store = SessionStore::shared();
            store.get_or_create(&session_id, &resolved.workspace_root).await;

            let ctx = AdapterContext {
                interpreter: resolved.interpreter.clone(),
                scanner_cmd: resolved.scanner_cmd.clone(),
                patcher_cmd: resolved.patcher_cmd.clone(),
                workspace_root: resolved.workspace_root.clone(),
            };
            let scanner = RealScanner {
                ctx: ctx.clone(),
                timeout: resolved.scan_timeout,
            };
            let patcher = RealPatcher {
                ctx,
                timeout: resolved.fix_timeout,
                auto_apply: true,
                claude_agent: true,
            };
            let opts = RunFullOptions {
                max_cycles,
                max_fixes_per_cycle,
                break_on_no_issues: !no_break_on_no_issues,
                comprehensive: !no_comprehensive,
            };
            let result = run_full(
                &store,
                &scanner,
                &patcher,
                &resolved.session_dir,
                &resolved.reports_dir,
                &session_id,
                &opts,
            )
            .await;
            store.persist(&session_id, &resolved.session_dir).await.ok();
            let result = result.map_err(anyhow::Error::from)?;

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "session_id": result.session_id,
                    "cycles_executed": result.cycles_run,
                    "termination_reason": result.termination_reason.to_string(),
                    "total_issues_found": result.total_issues_found,
                    "total_issues_fixed": result.total_issues_fixed,
                    "final_issue_count": result.final_issue_count,
                }))?
            );
            Ok(())
        }
        Commands::Status { session } => {
            let root = workspace_root.unwrap_or_else(|| {
                std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
            });
            let session_file = root
                .join("pipeline-sessions")
                .join(&session)
                .join("session.json");
            let raw = std::fs::read_to_string(&session_file).map_err(|_| {
                anyhow::Error::from(PipelineError::NotFound(session.clone()))
            })?;
            println!("{raw}");
            Ok(())
        }
        Commands::Serve => {
            let config = qpo_mcp::QpoServerConfig {
                workspace_root,
                ..Default::default()
            };
            let server = qpo_mcp::QpoServer::new(config);
            qpo_mcp::serve_stdio(server).await
        }
        Commands::ComplianceCheck => {
            let payload = serde_json::json!({
                "tools": [
                    "version_keeper_scan",
                    "quality_patcher_fix",
                    "pipeline_run_full",
                    "github_workflow_trigger",
                    "pipeline_status",
                    "mcp_compliance_check",
                ],
                "features": {
                    "structured_errors": true,
                    "session_concurrency": true,
                    "json_reports": true,
                },
                "version": env!("CARGO_PKG_VERSION"),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}
