//! Bounded subprocess execution with captured output
//!
//! Every command the core spawns (actions, verification checks, VCS reads,
//! process-table lookups) goes through here: piped stdout/stderr, a hard
//! timeout with kill-on-expiry, lossy UTF-8 decoding, and a truncation cap
//! so a chatty child cannot blow up plan records.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::error::{WardenError, WardenResult};

/// Per-stream capture cap.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// Captured result of one spawned command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when the child was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub truncated: bool,
}

impl CommandOutput {
    /// stderr if present, otherwise stdout. Failure text for diagnosis.
    pub fn failure_text(&self) -> String {
        if self.timed_out {
            return "command timed out".to_string();
        }
        if !self.stderr.trim().is_empty() {
            self.stderr.clone()
        } else {
            self.stdout.clone()
        }
    }
}

/// Run a shell command line via `sh -c`.
pub async fn run_shell(
    command: &str,
    cwd: Option<&Path>,
    timeout_secs: u64,
) -> WardenResult<CommandOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    run(cmd, cwd, timeout_secs).await
}

/// Run a program with explicit arguments, no shell interpretation.
pub async fn run_program(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout_secs: u64,
) -> WardenResult<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    run(cmd, cwd, timeout_secs).await
}

async fn run(mut cmd: Command, cwd: Option<&Path>, timeout_secs: u64) -> WardenResult<CommandOutput> {
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Dropping the wait future on timeout must not leak the child.
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| WardenError::Exec(format!("spawn failed: {}", e)))?;

    match timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let (stdout, out_truncated) = capture(&output.stdout);
            let (stderr, err_truncated) = capture(&output.stderr);
            Ok(CommandOutput {
                stdout,
                stderr,
                exit_code: output.status.code(),
                success: output.status.success(),
                timed_out: false,
                truncated: out_truncated || err_truncated,
            })
        }
        Ok(Err(e)) => Err(WardenError::Exec(format!("wait failed: {}", e))),
        Err(_) => {
            log::warn!("[Exec] command exceeded {}s timeout, killed", timeout_secs);
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!("timed out after {}s", timeout_secs),
                exit_code: None,
                success: false,
                timed_out: true,
                truncated: false,
            })
        }
    }
}

fn capture(bytes: &[u8]) -> (String, bool) {
    if bytes.len() > MAX_CAPTURE_BYTES {
        let mut text = String::from_utf8_lossy(&bytes[..MAX_CAPTURE_BYTES]).into_owned();
        text.push_str("\n... [truncated]");
        (text, true)
    } else {
        (String::from_utf8_lossy(bytes).into_owned(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_shell("echo hello", None, 10).await.unwrap();
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failed_output_not_an_error() {
        let out = run_shell("echo boom >&2; exit 3", None, 10).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.failure_text().trim(), "boom");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let out = run_shell("sleep 5", None, 1).await.unwrap();
        assert!(out.timed_out);
        assert!(!out.success);
        assert_eq!(out.exit_code, None);
    }

    #[tokio::test]
    async fn runs_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell("pwd", Some(dir.path()), 10).await.unwrap();
        assert!(out.stdout.trim().ends_with(
            dir.path()
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
        ));
    }
}
