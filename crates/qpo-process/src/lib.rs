//! Subprocess execution layer (`spec.md` C2): spawns external scanner/patcher
//! tools in an isolated process group, captures bounded stdout/stderr, and
//! enforces a wall-clock timeout with a SIGTERM-then-SIGKILL escalation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use qpo_core::PipelineError;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::warn;

/// Default grace period between SIGTERM and SIGKILL when a run times out.
pub const DEFAULT_KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Default cap on captured bytes per stream before truncation kicks in.
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 16 * 1024 * 1024;
const READ_BUF_SIZE: usize = 4096;

/// What to run and how to bound it.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub cmd: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Wall-clock limit measured from spawn, not from last activity. This
    /// intentionally departs from an idle-timeout model: a stalled,
    /// continuously-chattering scanner should still be killed once its
    /// budget is spent.
    pub timeout: Duration,
    pub capture_json: bool,
    pub kill_grace_period: Duration,
    pub max_capture_bytes: usize,
}

impl RunOptions {
    pub fn new(cmd: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            cmd: cmd.into(),
            args,
            env: HashMap::new(),
            cwd: None,
            timeout,
            capture_json: false,
            kill_grace_period: DEFAULT_KILL_GRACE_PERIOD,
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
        }
    }
}

/// Outcome of a completed (or killed) run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub parsed_json: Option<serde_json::Value>,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Run `opts.cmd` to completion or until its timeout fires.
///
/// On timeout the child's process group is sent `SIGTERM`; if it has not
/// exited after `opts.kill_grace_period` it is sent `SIGKILL`. Stdout/stderr
/// are read concurrently at the byte level so a non-line-terminated stream
/// (e.g. a progress indicator) cannot stall capture.
///
/// A timeout is reported through `RunOutcome.timed_out`, not `Err` -- the
/// buffers captured up to the kill are still returned so a caller can log
/// them before deciding the stage failed (`spec.md` §4.2: "returns with
/// `timed_out=true`..."). Only a spawn failure is an `Err` here.
pub async fn run(opts: RunOptions) -> Result<RunOutcome, PipelineError> {
    let started = Instant::now();
    let mut command = Command::new(&opts.cmd);
    command.args(&opts.args);
    for (key, value) in &opts.env {
        command.env(key, value);
    }
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());
    command.stdin(std::process::Stdio::null());
    command.kill_on_drop(true);

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(|source| PipelineError::SpawnFailed {
        cmd: format!("{} {}", opts.cmd, opts.args.join(" ")),
        source,
    })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let mut stdout_reader = BufReader::new(stdout);
    let mut stderr_reader = BufReader::new(stderr);

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_truncated = false;
    let mut stderr_truncated = false;
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut timed_out = false;

    let deadline = tokio::time::sleep(opts.timeout);
    tokio::pin!(deadline);

    let mut read_buf = [0u8; READ_BUF_SIZE];
    let mut read_buf2 = [0u8; READ_BUF_SIZE];

    while !stdout_done || !stderr_done {
        tokio::select! {
            result = stdout_reader.read(&mut read_buf), if !stdout_done => {
                match result {
                    Ok(0) => stdout_done = true,
                    Ok(n) => append_capped(&mut stdout_buf, &read_buf[..n], opts.max_capture_bytes, &mut stdout_truncated),
                    Err(_) => stdout_done = true,
                }
            }
            result = stderr_reader.read(&mut read_buf2), if !stderr_done => {
                match result {
                    Ok(0) => stderr_done = true,
                    Ok(n) => append_capped(&mut stderr_buf, &read_buf2[..n], opts.max_capture_bytes, &mut stderr_truncated),
                    Err(_) => stderr_done = true,
                }
            }
            _ = &mut deadline => {
                timed_out = true;
                warn!(cmd = %opts.cmd, timeout_secs = opts.timeout.as_secs(), "run exceeded wall-clock timeout, terminating");
                terminate_process_group(&mut child, opts.kill_grace_period).await;
                break;
            }
        }
    }

    let status = if timed_out {
        child.wait().await.ok()
    } else {
        Some(
            child
                .wait()
                .await
                .map_err(|source| PipelineError::SpawnFailed {
                    cmd: opts.cmd.clone(),
                    source,
                })?,
        )
    };

    let exit_code = if timed_out {
        137
    } else {
        status
            .and_then(|s| s.code())
            .unwrap_or(1)
    };

    let stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();

    let parsed_json = if opts.capture_json && exit_code == 0 && !timed_out {
        serde_json::from_str(&stdout).ok()
    } else {
        None
    };

    Ok(RunOutcome {
        exit_code,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        parsed_json,
        timed_out,
        duration: started.elapsed(),
    })
}

fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize, truncated: &mut bool) {
    if buf.len() >= cap {
        *truncated = true;
        return;
    }
    let remaining = cap - buf.len();
    if chunk.len() > remaining {
        buf.extend_from_slice(&chunk[..remaining]);
        *truncated = true;
    } else {
        buf.extend_from_slice(chunk);
    }
}

/// Send `SIGTERM` to the child's process group, then `SIGKILL` if it hasn't
/// exited within `grace_period`.
async fn terminate_process_group(child: &mut tokio::process::Child, grace_period: Duration) {
    #[cfg(unix)]
    {
        let Some(pid) = child.id() else {
            let _ = child.start_kill();
            return;
        };
        // SAFETY: kill() is async-signal-safe; negative PID targets the group.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
        let waited = tokio::time::timeout(grace_period, child.wait()).await;
        if waited.is_err() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace_period;
        let _ = child.start_kill();
    }
}

/// Check whether `executable` resolves to something runnable, either as an
/// absolute/relative path that exists or as a name found on `PATH`.
pub fn check_tool_installed(executable: &str) -> bool {
    let path = std::path::Path::new(executable);
    if path.components().count() > 1 {
        return path.exists();
    }
    which::which(executable).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let opts = RunOptions::new("sh", vec!["-c".into(), "echo hello".into()], Duration::from_secs(5));
        let outcome = run(opts).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.trim(), "hello");
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn captures_nonzero_exit_code() {
        let opts = RunOptions::new("sh", vec!["-c".into(), "exit 7".into()], Duration::from_secs(5));
        let outcome = run(opts).await.unwrap();
        assert_eq!(outcome.exit_code, 7);
    }

    #[tokio::test]
    async fn times_out_long_running_process() {
        let opts = RunOptions::new(
            "sh",
            vec!["-c".into(), "sleep 30".into()],
            Duration::from_millis(200),
        );
        let outcome = run(opts).await.unwrap();
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn parses_json_stdout_when_requested() {
        let mut opts = RunOptions::new(
            "sh",
            vec!["-c".into(), r#"echo '{"ok": true}'"#.into()],
            Duration::from_secs(5),
        );
        opts.capture_json = true;
        let outcome = run(opts).await.unwrap();
        assert_eq!(outcome.parsed_json, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn truncates_output_past_cap() {
        let mut opts = RunOptions::new(
            "sh",
            vec!["-c".into(), "yes x | head -c 1000".into()],
            Duration::from_secs(5),
        );
        opts.max_capture_bytes = 100;
        let outcome = run(opts).await.unwrap();
        assert!(outcome.stdout_truncated);
        assert!(outcome.stdout.len() <= 100);
    }

    #[test]
    fn detects_missing_tool() {
        assert!(!check_tool_installed("definitely-not-a-real-binary-xyz"));
    }
}
