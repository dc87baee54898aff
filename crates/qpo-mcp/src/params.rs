//! Input schemas for the six tools. Every field but the handful marked
//! required is optional, with defaults applied by the handler rather than
//! `serde(default)` so the defaults live in one place instead of being
//! scattered across struct attributes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ScanParams {
    #[schemars(description = "Session to scan; generated if omitted")]
    pub session_id: Option<String>,
    #[schemars(description = "Run the scanner's comprehensive mode (default true)")]
    pub comprehensive: Option<bool>,
    #[schemars(description = "Must be \"json\" if set; reserved for forward compatibility")]
    pub output_format: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FixParams {
    #[schemars(description = "Session to fix; generated if omitted")]
    pub session_id: Option<String>,
    #[schemars(description = "Maximum number of fixes to apply this call (default 10)")]
    pub max_fixes: Option<u32>,
    #[schemars(description = "Let the patcher write changes to disk (default true)")]
    pub auto_apply: Option<bool>,
    #[schemars(description = "Route fixes through the Claude agent backend (default true)")]
    pub claude_agent: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RunFullParams {
    #[schemars(description = "Session to drive; generated if omitted")]
    pub session_id: Option<String>,
    #[schemars(description = "Maximum scan/fix/validate cycles before giving up (default 10)")]
    pub max_cycles: Option<u32>,
    #[schemars(description = "Maximum fixes applied per cycle (default 10)")]
    pub max_fixes_per_cycle: Option<u32>,
    #[schemars(description = "Stop immediately if the first scan finds nothing (default true)")]
    pub break_on_no_issues: Option<bool>,
    #[schemars(description = "Run the scanner's comprehensive mode (default true)")]
    pub comprehensive: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowTriggerParams {
    #[schemars(description = "GitHub Actions workflow file or name to dispatch")]
    pub workflow: String,
    #[schemars(description = "workflow_dispatch inputs, passed as --field key=value pairs")]
    pub inputs: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(rename = "ref")]
    #[schemars(description = "Git ref to run the workflow against (default: repository default branch)")]
    pub git_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StatusParams {
    #[schemars(description = "Session id to inspect")]
    pub session_id: String,
}
