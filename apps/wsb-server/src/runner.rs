//! Subprocess runner: launches the bootstrap interpreter, drains its output
//! without deadlocking, and recovers the structured log records the child
//! smuggles through stdout/stderr.
//!
//! The child interleaves developer diagnostics with user-facing messages on
//! the same pipes, so user-facing records travel base64-encoded on lines
//! tagged with [`LOGGING_PREFIX`]; everything untagged is dropped from the
//! filtered output and only surfaces at debug level here.

use anyhow::{Context, Result};
use base64::Engine as _;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Tag marking a base64-encoded UTF-8 log record on child stdout/stderr.
pub const LOGGING_PREFIX: &str = "BRIDGE_LOG64:";

/// Child exit code: configuration bootstrap failed inside the engine.
pub const ENGINE_INIT_ERROR_EXIT_CODE: i32 = 77;
/// Child exit code: configuration resolved but its environment is invalid.
pub const UNRESOLVED_ENV_ERROR_EXIT_CODE: i32 = 78;

#[derive(Debug)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunOutput {
    pub fn status(&self) -> RunStatus {
        match self.exit_code {
            0 => RunStatus::Success,
            ENGINE_INIT_ERROR_EXIT_CODE => RunStatus::EngineInitError,
            UNRESOLVED_ENV_ERROR_EXIT_CODE => RunStatus::UnresolvedEnvironment,
            code => RunStatus::Failed(code),
        }
    }

    /// Decoded tagged records from stdout, joined with newlines.
    pub fn filtered_stdout(&self) -> String {
        filtered_output(&self.stdout)
    }

    /// Decoded tagged records from stderr, joined with newlines.
    pub fn filtered_stderr(&self) -> String {
        filtered_output(&self.stderr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    EngineInitError,
    UnresolvedEnvironment,
    Failed(i32),
}

/// Spawns `interpreter script args_file` and waits for exit. Stdin is closed
/// immediately; stdout and stderr are drained by independent tasks so a
/// chatty child can never fill one pipe while we block on the other.
pub async fn run(interpreter: &Path, script: &Path, args_file: &Path) -> Result<RunOutput> {
    let mut child = Command::new(interpreter)
        .arg(script)
        .arg(args_file)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {}", interpreter.display()))?;

    let mut stdout_pipe = child.stdout.take().context("child stdout not captured")?;
    let mut stderr_pipe = child.stderr.take().context("child stderr not captured")?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let status = child.wait().await.context("waiting for child")?;
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let exit_code = status.code().unwrap_or(-1);
    debug!(
        exit_code,
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        script = %script.display(),
        "subprocess finished"
    );
    Ok(RunOutput {
        exit_code,
        stdout,
        stderr,
    })
}

fn filtered_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut records = Vec::new();
    for line in text.lines() {
        let Some(encoded) = line.strip_prefix(LOGGING_PREFIX) else {
            if !line.trim().is_empty() {
                debug!(line, "untagged subprocess output dropped");
            }
            continue;
        };
        match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(record) => records.push(record),
                Err(err) => warn!(%err, "tagged log record is not UTF-8"),
            },
            Err(err) => warn!(%err, "tagged log record is not valid base64"),
        }
    }
    records.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use std::fs;
    use tempfile::tempdir;

    fn encode(msg: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(msg.as_bytes())
    }

    #[test]
    fn filtered_output_keeps_only_tagged_lines() {
        let raw = format!(
            "debug noise\n{}{}\nmore noise\n{}{}\n",
            LOGGING_PREFIX,
            encode("first record"),
            LOGGING_PREFIX,
            encode("second record"),
        );
        assert_eq!(
            filtered_output(raw.as_bytes()),
            "first record\nsecond record"
        );
    }

    #[test]
    fn filtered_output_skips_broken_base64() {
        let raw = format!("{}not-base64!!!\n{}{}\n", LOGGING_PREFIX, LOGGING_PREFIX, encode("ok"));
        assert_eq!(filtered_output(raw.as_bytes()), "ok");
    }

    #[test]
    fn exit_codes_classify() {
        let out = |code| RunOutput {
            exit_code: code,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert_eq!(out(0).status(), RunStatus::Success);
        assert_eq!(out(77).status(), RunStatus::EngineInitError);
        assert_eq!(out(78).status(), RunStatus::UnresolvedEnvironment);
        assert_eq!(out(3).status(), RunStatus::Failed(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_collects_streams_and_exit_code() {
        let tmp = tempdir().unwrap();
        let script = tmp.path().join("child.sh");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho '{}{}'\necho plain-diagnostic\necho err-line 1>&2\nexit 5\n",
                LOGGING_PREFIX,
                encode("hello from child"),
            ),
        )
        .unwrap();
        let args = tmp.path().join("args.json");
        fs::write(&args, "{}").unwrap();

        let out = run(Path::new("/bin/sh"), &script, &args).await.unwrap();
        assert_eq!(out.exit_code, 5);
        assert_eq!(out.status(), RunStatus::Failed(5));
        assert_eq!(out.filtered_stdout(), "hello from child");
        assert_eq!(out.filtered_stderr(), "");
        assert!(String::from_utf8_lossy(&out.stderr).contains("err-line"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_closes_stdin() {
        let tmp = tempdir().unwrap();
        let script = tmp.path().join("child.sh");
        // cat exits immediately when stdin is closed; a blocked child would
        // hang this test instead.
        fs::write(&script, "#!/bin/sh\ncat\nexit 0\n").unwrap();
        let args = tmp.path().join("args.json");
        fs::write(&args, "{}").unwrap();
        let out = run(Path::new("/bin/sh"), &script, &args).await.unwrap();
        assert_eq!(out.status(), RunStatus::Success);
    }
}
