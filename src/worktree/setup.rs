//! Per-worktree setup script execution.
//!
//! The script runs through `sh -c` inside the new worktree with a JSON
//! description of the worktree on stdin and the same fields in `ORCHARD_*`
//! environment variables. Exit code 0 is success; anything else, a timeout,
//! or cancellation is a setup failure.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What the setup script is told about its worktree.
#[derive(Debug, Clone, Serialize)]
pub struct SetupContext {
    pub spec_id: String,
    pub worktree: PathBuf,
    pub branch: String,
    pub source_root: PathBuf,
}

/// Run `script` for `ctx`. Returns a human-readable failure reason on error.
pub async fn run_setup_script(
    script: &str,
    ctx: &SetupContext,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let context_json = serde_json::to_string(ctx)
        .map_err(|e| format!("failed to serialize setup context: {}", e))?;

    debug!(spec = %ctx.spec_id, script, timeout_secs = limit.as_secs(), "running setup script");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(&ctx.worktree)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("ORCHARD_SPEC_ID", &ctx.spec_id)
        .env("ORCHARD_WORKTREE", &ctx.worktree)
        .env("ORCHARD_BRANCH", &ctx.branch)
        .env("ORCHARD_SOURCE_ROOT", &ctx.source_root)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn setup script '{}': {}", script, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        // Scripts that never read stdin close the pipe early.
        if let Err(e) = stdin.write_all(context_json.as_bytes()).await {
            debug!(spec = %ctx.spec_id, error = %e, "setup script did not read its context");
        }
    }

    let output = tokio::select! {
        result = child.wait_with_output() => {
            result.map_err(|e| format!("failed to wait for setup script: {}", e))?
        }
        _ = tokio::time::sleep(limit) => {
            warn!(spec = %ctx.spec_id, "setup script timed out");
            return Err(format!("setup script timed out after {} seconds", limit.as_secs()));
        }
        _ = cancel.cancelled() => {
            return Err("setup script cancelled".to_string());
        }
    };

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if !stderr.trim().is_empty() {
        stderr.trim().to_string()
    } else {
        stdout.trim().to_string()
    };
    let code = output
        .status
        .code()
        .map_or_else(|| "signal".to_string(), |c| c.to_string());
    Err(if detail.is_empty() {
        format!("setup script exited with {}", code)
    } else {
        format!("setup script exited with {}: {}", code, last_lines(&detail, 5))
    })
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// Resolve a configured script: a path relative to the source root that
/// exists is run with `sh` by absolute path, anything else is passed to the
/// shell as a command line.
pub fn resolve_script(script: &str, source_root: &Path) -> String {
    let candidate = source_root.join(script);
    if !script.contains(char::is_whitespace) && candidate.is_file() {
        let quoted = candidate.to_string_lossy().replace('\'', "'\\''");
        format!("sh '{}'", quoted)
    } else {
        script.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(dir: &Path) -> SetupContext {
        SetupContext {
            spec_id: "api".into(),
            worktree: dir.to_path_buf(),
            branch: "plan/api".into(),
            source_root: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_successful_script_sees_environment() {
        let dir = tempdir().unwrap();
        let result = run_setup_script(
            "echo \"$ORCHARD_SPEC_ID\" > marker.txt",
            &ctx(dir.path()),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_ok());
        let marker = std::fs::read_to_string(dir.path().join("marker.txt")).unwrap();
        assert_eq!(marker.trim(), "api");
    }

    #[tokio::test]
    async fn test_failing_script_reports_stderr() {
        let dir = tempdir().unwrap();
        let err = run_setup_script(
            "echo broken >&2; exit 3",
            &ctx(dir.path()),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.contains("exited with 3"));
        assert!(err.contains("broken"));
    }

    #[tokio::test]
    async fn test_script_timeout() {
        let dir = tempdir().unwrap();
        let err = run_setup_script(
            "sleep 5",
            &ctx(dir.path()),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.contains("timed out"));
    }

    #[tokio::test]
    async fn test_script_cancellation() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_setup_script("sleep 5", &ctx(dir.path()), Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(err.contains("cancelled"));
    }

    #[test]
    fn test_resolve_script_prefers_existing_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("setup.sh"), "true").unwrap();
        assert_eq!(
            resolve_script("setup.sh", dir.path()),
            format!("sh '{}'", dir.path().join("setup.sh").display())
        );
        assert_eq!(resolve_script("make deps", dir.path()), "make deps");
    }
}
