//! Concrete [`Scanner`]/[`Patcher`] implementations backed by real
//! subprocesses, wiring `qpo-adapters` into the cycle machine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use qpo_adapters::{AdapterContext, FixOptions, ScanOptions};
use qpo_core::PipelineError;
use qpo_report::{FixReport, LintReport};

use crate::{Patcher, Scanner};

pub struct RealScanner {
    pub ctx: AdapterContext,
    pub timeout: Duration,
}

#[async_trait]
impl Scanner for RealScanner {
    async fn scan(
        &self,
        session_dir: &Path,
        reports_dir: &Path,
        cycle: u32,
        comprehensive: bool,
    ) -> Result<(LintReport, PathBuf), PipelineError> {
        let opts = ScanOptions {
            comprehensive,
            extra_args: Vec::new(),
        };
        qpo_adapters::run_scan(&self.ctx, session_dir, reports_dir, cycle, self.timeout, &opts).await
    }
}

pub struct RealPatcher {
    pub ctx: AdapterContext,
    pub timeout: Duration,
    pub auto_apply: bool,
    pub claude_agent: bool,
}

#[async_trait]
impl Patcher for RealPatcher {
    async fn fix(
        &self,
        session_dir: &Path,
        reports_dir: &Path,
        cycle: u32,
        lint_report_path: &Path,
        max_fixes: u32,
    ) -> Result<(FixReport, PathBuf), PipelineError> {
        let opts = FixOptions {
            max_fixes,
            auto_apply: self.auto_apply,
            claude_agent: self.claude_agent,
        };
        qpo_adapters::run_fix(
            &self.ctx,
            session_dir,
            reports_dir,
            cycle,
            lint_report_path,
            self.timeout,
            &opts,
        )
        .await
    }
}
