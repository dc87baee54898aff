//! Report & artifact schema (`spec.md` C4): the JSON documents scan/fix
//! stages exchange with the orchestrator, plus atomic read/write helpers.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use qpo_core::PipelineError;
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LintIssue {
    pub file: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub severity: String,
    pub rule: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LintSummary {
    pub total: u64,
    pub by_severity: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintReport {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub issues: Vec<LintIssue>,
    pub summary: LintSummary,
}

impl LintReport {
    pub fn new(issues: Vec<LintIssue>, generated_at: DateTime<Utc>) -> Self {
        let summary = summarize_lint(&issues);
        Self {
            schema_version: SCHEMA_VERSION,
            generated_at,
            issues,
            summary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixedIssue {
    pub file: String,
    pub line: u32,
    pub rule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixReport {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub fixed: Vec<FixedIssue>,
    pub applied_count: u64,
    pub remaining: u64,
    /// Set when the patcher exited non-zero but still produced a usable
    /// report -- the orchestrator treats this as a partial success rather
    /// than a hard failure (`spec.md` §4.5/§7).
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// The single place issue counts get rolled up from; both the report writer
/// and any caller that wants a quick count go through this.
pub fn summarize_lint(issues: &[LintIssue]) -> LintSummary {
    let mut by_severity = BTreeMap::new();
    for issue in issues {
        *by_severity.entry(issue.severity.clone()).or_insert(0) += 1;
    }
    LintSummary {
        total: issues.len() as u64,
        by_severity,
    }
}

pub fn read_lint(path: &Path) -> Result<LintReport, PipelineError> {
    read_json(path, "lint report")
}

pub fn write_lint(path: &Path, report: &LintReport) -> Result<(), PipelineError> {
    write_json(path, report)
}

pub fn read_fix(path: &Path) -> Result<FixReport, PipelineError> {
    read_json(path, "fix report")
}

pub fn write_fix(path: &Path, report: &FixReport) -> Result<(), PipelineError> {
    write_json(path, report)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, kind: &str) -> Result<T, PipelineError> {
    let raw = std::fs::read_to_string(path).map_err(|e| PipelineError::MalformedOutput {
        source: path.display().to_string(),
        detail: format!("failed to read {kind}: {e}"),
    })?;
    serde_json::from_str(&raw).map_err(|e| PipelineError::MalformedOutput {
        source: path.display().to_string(),
        detail: format!("failed to parse {kind}: {e}"),
    })
}

/// Write `value` to `path` atomically: serialize to `<path>.tmp`, then
/// `fs::rename` over the destination so a reader never observes a partial
/// file, even if the process is killed mid-write.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(value).map_err(|e| {
        PipelineError::Internal(format!("failed to serialize report: {e}"))
    })?;
    std::fs::write(&tmp_path, body).map_err(|e| {
        PipelineError::Internal(format!("failed to write {}: {e}", tmp_path.display()))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        PipelineError::Internal(format!("failed to rename into {}: {e}", path.display()))
    })?;
    Ok(())
}
