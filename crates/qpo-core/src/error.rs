//! The taxonomy errors are mapped to MCP error codes and CLI exit codes by
//! `qpo-mcp` and `qpo` respectively; this enum is the single source of truth
//! for "what can go wrong" across the workspace.

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no session matching id '{0}'")]
    NotFound(String),

    #[error("stage already running for session '{0}'")]
    Conflict(String),

    #[error("invalid workspace '{path}': {reason}")]
    InvalidWorkspace { path: String, reason: String },

    #[error("no usable command for tool '{0}': not found on PATH and no override configured")]
    MissingTool(String),

    #[error("failed to spawn '{cmd}': {source}")]
    SpawnFailed {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stage '{stage}' timed out after {timeout_secs}s")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("tool exited with code {exit_code} and produced no usable report: {detail}")]
    ToolError { exit_code: i32, detail: String },

    #[error("malformed output from '{source}': {detail}")]
    MalformedOutput { source: String, detail: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// MCP error code as used in the `error.code` field of the tool
    /// response envelope.
    pub fn mcp_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::InvalidWorkspace { .. } => "InvalidWorkspace",
            Self::MissingTool(_) => "MissingTool",
            Self::SpawnFailed { .. } => "SpawnFailed",
            Self::Timeout { .. } => "Timeout",
            Self::ToolError { .. } => "ToolError",
            Self::MalformedOutput { .. } => "MalformedOutput",
            Self::Internal(_) => "Internal",
        }
    }

    /// CLI exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) => 2,
            Self::NotFound(_) => 3,
            Self::ToolError { .. } | Self::MalformedOutput { .. } => 4,
            Self::Timeout { .. } => 5,
            Self::Conflict(_)
            | Self::InvalidWorkspace { .. }
            | Self::MissingTool(_)
            | Self::SpawnFailed { .. }
            | Self::Internal(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_invalid_request() {
        let err = PipelineError::InvalidRequest("missing field 'workflow'".into());
        assert_eq!(
            err.to_string(),
            "invalid request: missing field 'workflow'"
        );
    }

    #[test]
    fn display_not_found() {
        let err = PipelineError::NotFound("pipeline_123".into());
        assert_eq!(err.to_string(), "no session matching id 'pipeline_123'");
    }

    #[test]
    fn exit_codes_match_spec() {
        assert_eq!(PipelineError::InvalidRequest("x".into()).exit_code(), 2);
        assert_eq!(PipelineError::NotFound("x".into()).exit_code(), 3);
        assert_eq!(
            PipelineError::ToolError {
                exit_code: 1,
                detail: "x".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(
            PipelineError::Timeout {
                stage: "fix".into(),
                timeout_secs: 10
            }
            .exit_code(),
            5
        );
        assert_eq!(PipelineError::Internal("x".into()).exit_code(), 1);
    }

    #[test]
    fn mcp_codes_cover_taxonomy() {
        assert_eq!(
            PipelineError::Conflict("s1".into()).mcp_code(),
            "Conflict"
        );
        assert_eq!(
            PipelineError::MalformedOutput {
                source: "scanner".into(),
                detail: "not json".into()
            }
            .mcp_code(),
            "MalformedOutput"
        );
    }
}
