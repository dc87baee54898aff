//! Pipeline orchestrator (`spec.md` C6): drives the scan -> fix -> validate
//! cycle machine to either a zero-issue state or budget exhaustion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use qpo_core::{PipelineError, StageKind, TerminationReason};
use qpo_report::{FixReport, LintReport};
use qpo_session::{SessionStore, StageOutcome};
use tracing::{info, warn};

pub mod real;
pub use real::{RealPatcher, RealScanner};

/// Abstracts the scanner so the cycle machine can be tested against an
/// in-process fake instead of a real subprocess. Returns the report
/// alongside the path it was written to under `reports_dir` (`spec.md`
/// §6.3: `lint-<cycle>-<timestamp>.json`).
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(
        &self,
        session_dir: &Path,
        reports_dir: &Path,
        cycle: u32,
        comprehensive: bool,
    ) -> Result<(LintReport, PathBuf), PipelineError>;
}

/// Abstracts the patcher for the same reason.
#[async_trait]
pub trait Patcher: Send + Sync {
    async fn fix(
        &self,
        session_dir: &Path,
        reports_dir: &Path,
        cycle: u32,
        lint_report_path: &Path,
        max_fixes: u32,
    ) -> Result<(FixReport, PathBuf), PipelineError>;
}

#[derive(Debug, Clone)]
pub struct RunFullOptions {
    pub max_cycles: u32,
    pub max_fixes_per_cycle: u32,
    pub break_on_no_issues: bool,
    pub comprehensive: bool,
}

impl Default for RunFullOptions {
    fn default() -> Self {
        Self {
            max_cycles: 10,
            max_fixes_per_cycle: 10,
            break_on_no_issues: true,
            comprehensive: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub session_id: String,
    pub cycles_run: u32,
    pub termination_reason: TerminationReason,
    pub total_issues_found: u64,
    pub total_issues_fixed: u64,
    pub final_issue_count: u64,
}

const STALL_ROUNDS_LIMIT: u32 = 2;

/// Drive a session through repeated scan/fix/validate cycles.
///
/// Each cycle: scan for issues; if none, terminate with `ZeroIssues`.
/// Otherwise fix up to `max_fixes_per_cycle` of them, then re-scan
/// ("validating") to measure progress. If the validating scan's issue count
/// fails to improve for `STALL_ROUNDS_LIMIT` consecutive cycles, or
/// `max_cycles` is reached, terminate with `BudgetExhausted`.
///
/// `max_cycles = 0` is a caller-supplied zero budget (`spec.md` §8): it
/// returns immediately with `BudgetExhausted` and zero cycle records,
/// without invoking the scanner or patcher at all.
pub async fn run_full(
    store: &Arc<SessionStore>,
    scanner: &dyn Scanner,
    patcher: &dyn Patcher,
    session_dir: &Path,
    reports_dir: &Path,
    session_id: &str,
    opts: &RunFullOptions,
) -> Result<PipelineResult, PipelineError> {
    if opts.max_cycles == 0 {
        store
            .finish(session_id, &TerminationReason::BudgetExhausted)
            .await?;
        return Ok(PipelineResult {
            session_id: session_id.to_string(),
            cycles_run: 0,
            termination_reason: TerminationReason::BudgetExhausted,
            total_issues_found: 0,
            total_issues_fixed: 0,
            final_issue_count: 0,
        });
    }

    let mut total_found = 0u64;
    let mut total_fixed = 0u64;
    let mut previous_count: Option<u64> = None;
    let mut stall_rounds = 0u32;
    let mut cycles_run = 0u32;
    let mut last_issue_count = 0u64;

    for cycle_index in 1..=opts.max_cycles {
        cycles_run = cycle_index;

        let cycle = store.begin_stage(session_id, StageKind::Scanning).await?;
        let (scan_report, lint_report_path) =
            match scanner.scan(session_dir, reports_dir, cycle, opts.comprehensive).await {
                Ok(result) => result,
                Err(e) => {
                    finish_failed(store, session_id, "scan", &e).await;
                    return Err(e);
                }
            };
        let scan_count = scan_report.summary.total;
        store
            .end_stage(
                session_id,
                StageOutcome {
                    exit_code: 0,
                    report_path: Some(lint_report_path.clone()),
                    issues_found: scan_count,
                    remaining_issues: Some(scan_count),
                    ..Default::default()
                },
            )
            .await?;
        total_found += scan_count;
        last_issue_count = scan_count;

        if scan_count == 0 && opts.break_on_no_issues {
            store.finish(session_id, &TerminationReason::ZeroIssues).await?;
            return Ok(PipelineResult {
                session_id: session_id.to_string(),
                cycles_run,
                termination_reason: TerminationReason::ZeroIssues,
                total_issues_found: total_found,
                total_issues_fixed: total_fixed,
                final_issue_count: 0,
            });
        }

        store.begin_stage(session_id, StageKind::Fixing).await?;
        let (fix_report, fix_report_path) = match patcher
            .fix(session_dir, reports_dir, cycle, &lint_report_path, opts.max_fixes_per_cycle)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                finish_failed(store, session_id, "fix", &e).await;
                return Err(e);
            }
        };
        store
            .end_stage(
                session_id,
                StageOutcome {
                    exit_code: 0,
                    report_path: Some(fix_report_path.clone()),
                    fixes_applied: fix_report.applied_count,
                    remaining_issues: None,
                    ..Default::default()
                },
            )
            .await?;
        total_fixed += fix_report.applied_count;
        if fix_report.partial {
            for warning in &fix_report.warnings {
                warn!(session_id, warning, "fix stage reported a partial result");
            }
        }

        store.begin_stage(session_id, StageKind::Validating).await?;
        let (validate_report, validate_report_path) =
            match scanner.scan(session_dir, reports_dir, cycle, opts.comprehensive).await {
                Ok(result) => result,
                Err(e) => {
                    finish_failed(store, session_id, "validate", &e).await;
                    return Err(e);
                }
            };
        let validate_count = validate_report.summary.total;
        store
            .end_stage(
                session_id,
                StageOutcome {
                    exit_code: 0,
                    report_path: Some(validate_report_path),
                    issues_found: validate_count,
                    remaining_issues: Some(validate_count),
                    ..Default::default()
                },
            )
            .await?;
        last_issue_count = validate_count;

        if validate_count > scan_count {
            warn!(
                session_id,
                cycle_index,
                scan_count,
                validate_count,
                "validating scan reported more issues than the cycle's initial scan"
            );
        }

        if validate_count == 0 {
            store.finish(session_id, &TerminationReason::ZeroIssues).await?;
            return Ok(PipelineResult {
                session_id: session_id.to_string(),
                cycles_run,
                termination_reason: TerminationReason::ZeroIssues,
                total_issues_found: total_found,
                total_issues_fixed: total_fixed,
                final_issue_count: 0,
            });
        }

        if let Some(previous) = previous_count {
            if validate_count >= previous {
                stall_rounds += 1;
            } else {
                stall_rounds = 0;
            }
        }
        previous_count = Some(validate_count);

        if stall_rounds >= STALL_ROUNDS_LIMIT {
            warn!(
                session_id,
                validate_count, "no progress across consecutive cycles; stopping early"
            );
            store
                .finish(session_id, &TerminationReason::BudgetExhausted)
                .await?;
            return Ok(PipelineResult {
                session_id: session_id.to_string(),
                cycles_run,
                termination_reason: TerminationReason::BudgetExhausted,
                total_issues_found: total_found,
                total_issues_fixed: total_fixed,
                final_issue_count: last_issue_count,
            });
        }
    }

    info!(session_id, cycles_run, "exhausted cycle budget");
    store
        .finish(session_id, &TerminationReason::BudgetExhausted)
        .await?;
    Ok(PipelineResult {
        session_id: session_id.to_string(),
        cycles_run,
        termination_reason: TerminationReason::BudgetExhausted,
        total_issues_found: total_found,
        total_issues_fixed: total_fixed,
        final_issue_count: last_issue_count,
    })
}

async fn finish_failed(store: &Arc<SessionStore>, session_id: &str, stage: &str, error: &PipelineError) {
    if let Err(e) = store.fail_stage(session_id, error.to_string()).await {
        warn!(session_id, error = %e, "failed to record stage failure");
    }
    if let Err(e) = store
        .finish(session_id, &TerminationReason::Failed(stage.to_string()))
        .await
    {
        warn!(session_id, error = %e, "failed to record session failure");
    }
}
