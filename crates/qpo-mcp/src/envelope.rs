//! The response envelope every tool returns, and the single place a
//! [`PipelineError`] is translated into it.

use qpo_core::PipelineError;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub tool: &'static str,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub execution_time_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Envelope {
    pub fn success(
        tool: &'static str,
        session_id: Option<String>,
        execution_time_ms: u128,
        results: Value,
    ) -> Self {
        Self {
            tool,
            status: "success",
            session_id,
            execution_time_ms,
            results: Some(results),
            error: None,
        }
    }

    /// A patcher partial success: still `status: "success"`, but with the
    /// `warnings` array folded into `results` by the caller.
    pub fn partial(
        tool: &'static str,
        session_id: Option<String>,
        execution_time_ms: u128,
        results: Value,
    ) -> Self {
        Self::success(tool, session_id, execution_time_ms, results)
    }

    pub fn error(
        tool: &'static str,
        session_id: Option<String>,
        execution_time_ms: u128,
        err: &PipelineError,
        stderr_path: Option<String>,
    ) -> Self {
        Self {
            tool,
            status: "error",
            session_id,
            execution_time_ms,
            results: None,
            error: Some(ErrorPayload {
                code: err.mcp_code(),
                message: err.to_string(),
                stderr_path,
            }),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| {
            format!(r#"{{"tool":"{}","status":"error","error":{{"code":"Internal","message":"failed to serialize envelope: {e}"}}}}"#, self.tool)
        })
    }
}
