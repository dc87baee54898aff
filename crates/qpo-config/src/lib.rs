//! Path & env resolver: turns caller-supplied parameters and on-disk/
//! environment configuration into a [`ResolvedConfig`] the rest of the
//! pipeline operates on.

mod file_config;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use qpo_core::PipelineError;

pub use file_config::FileConfig;

pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_FIX_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_MAX_CONCURRENT_SUBPROCESSES: usize = 8;
const DEFAULT_SCANNER_CMD: &[&str] = &["scripts/version_keeper.py"];
const DEFAULT_PATCHER_CMD: &[&str] = &["scripts/claude_quality_patcher.py"];
const CONFIG_FILE_NAME: &str = ".mcp-server-config.json";

/// Caller-supplied inputs to [`resolve`]. Every field is optional except the
/// workspace root; everything else falls back to on-disk config, then env,
/// then hardcoded defaults.
#[derive(Debug, Clone, Default)]
pub struct ResolveParams {
    pub workspace_root: Option<PathBuf>,
    pub session_id: String,
    pub interpreter: Option<String>,
    pub scanner_cmd: Option<Vec<String>>,
    pub patcher_cmd: Option<Vec<String>>,
    pub scan_timeout_s: Option<u64>,
    pub fix_timeout_s: Option<u64>,
    pub max_concurrent_subprocesses: Option<usize>,
}

/// Fully resolved, ready-to-use configuration for one session's lifetime.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub workspace_root: PathBuf,
    pub session_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub interpreter: String,
    pub scanner_cmd: Vec<String>,
    pub patcher_cmd: Vec<String>,
    pub scan_timeout: Duration,
    pub fix_timeout: Duration,
    pub max_concurrent_subprocesses: usize,
}

/// Resolve a [`ResolvedConfig`] from caller params, the workspace's
/// `.mcp-server-config.json` (if present), and environment overrides.
///
/// Idempotent with respect to the filesystem except for creating the
/// session directory (mode 0755 on Unix) if it does not already exist.
pub fn resolve(params: &ResolveParams) -> Result<ResolvedConfig, PipelineError> {
    let workspace_root = params
        .workspace_root
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if !workspace_root.is_dir() {
        return Err(PipelineError::InvalidWorkspace {
            path: workspace_root.display().to_string(),
            reason: "does not exist or is not a directory".to_string(),
        });
    }
    let workspace_root = workspace_root.canonicalize().unwrap_or(workspace_root);

    let file_config = FileConfig::load(&workspace_root.join(CONFIG_FILE_NAME)).map_err(|e| {
        PipelineError::InvalidRequest(format!("failed to parse {CONFIG_FILE_NAME}: {e:#}"))
    })?;

    let interpreter = params
        .interpreter
        .clone()
        .or_else(|| file_config.interpreter.clone())
        .or_else(|| std::env::var("QPO_INTERPRETER").ok())
        .unwrap_or_else(default_interpreter);

    let scanner_cmd = params
        .scanner_cmd
        .clone()
        .or_else(|| file_config.scanner_cmd.clone())
        .or_else(|| env_cmd("QPO_SCANNER_CMD"))
        .unwrap_or_else(|| DEFAULT_SCANNER_CMD.iter().map(|s| s.to_string()).collect());

    let patcher_cmd = params
        .patcher_cmd
        .clone()
        .or_else(|| file_config.patcher_cmd.clone())
        .or_else(|| env_cmd("QPO_PATCHER_CMD"))
        .unwrap_or_else(|| DEFAULT_PATCHER_CMD.iter().map(|s| s.to_string()).collect());

    ensure_tool_available(&interpreter, &scanner_cmd, &workspace_root)?;
    ensure_tool_available(&interpreter, &patcher_cmd, &workspace_root)?;

    let scan_timeout_s = params
        .scan_timeout_s
        .or(file_config.scan_timeout_s)
        .or_else(|| env_u64("QPO_SCAN_TIMEOUT_S"))
        .unwrap_or(DEFAULT_SCAN_TIMEOUT_SECS);
    let fix_timeout_s = params
        .fix_timeout_s
        .or(file_config.fix_timeout_s)
        .or_else(|| env_u64("QPO_FIX_TIMEOUT_S"))
        .unwrap_or(DEFAULT_FIX_TIMEOUT_SECS);
    let max_concurrent_subprocesses = params
        .max_concurrent_subprocesses
        .or(file_config.max_concurrent_subprocesses)
        .or_else(|| env_u64("QPO_MAX_CONCURRENT_SUBPROCESSES").map(|v| v as usize))
        .unwrap_or(DEFAULT_MAX_CONCURRENT_SUBPROCESSES);

    let session_dir = workspace_root
        .join("pipeline-sessions")
        .join(&params.session_id);
    create_session_dir(&session_dir)?;
    let reports_dir = session_dir.join("reports");
    create_session_dir(&reports_dir)?;

    Ok(ResolvedConfig {
        workspace_root,
        session_dir,
        reports_dir,
        interpreter,
        scanner_cmd,
        patcher_cmd,
        scan_timeout: Duration::from_secs(scan_timeout_s),
        fix_timeout: Duration::from_secs(fix_timeout_s),
        max_concurrent_subprocesses,
    })
}

fn default_interpreter() -> String {
    if which::which("python3").is_ok() {
        "python3".to_string()
    } else {
        "python".to_string()
    }
}

/// A tool command is available if its first argv token resolves either as a
/// workspace-relative script (checked for existence) or as an executable on
/// `PATH`. We don't require the *script* to exist when it's invoked through
/// the interpreter and is itself missing -- that failure surfaces later as
/// `SpawnFailed`/`ToolError` from the adapter, not at resolve time -- but a
/// completely unconfigured, unresolvable command is rejected up front.
fn ensure_tool_available(
    interpreter: &str,
    cmd: &[String],
    workspace_root: &Path,
) -> Result<(), PipelineError> {
    if which::which(interpreter).is_err() {
        return Err(PipelineError::MissingTool(interpreter.to_string()));
    }
    let Some(script) = cmd.first() else {
        return Err(PipelineError::MissingTool("<empty command>".to_string()));
    };
    let script_path = workspace_root.join(script);
    if script_path.exists() || which::which(script).is_ok() {
        return Ok(());
    }
    Err(PipelineError::MissingTool(script.clone()))
}

fn create_session_dir(dir: &Path) -> Result<(), PipelineError> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))
        .map_err(|e| PipelineError::Internal(e.to_string()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(dir) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o755);
            let _ = std::fs::set_permissions(dir, perms);
        }
    }
    Ok(())
}

fn env_cmd(var: &str) -> Option<Vec<String>> {
    std::env::var(var)
        .ok()
        .map(|raw| raw.split_whitespace().map(str::to_string).collect())
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}
