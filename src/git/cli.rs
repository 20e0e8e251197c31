//! Thin async wrapper over the `git` command line.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Captured result of a `git` invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run `git <args>` in `dir` and capture its output. A non-zero exit is not an
/// error here; see [`git_checked`].
pub async fn git(dir: &Path, args: &[&str]) -> Result<GitOutput> {
    debug!(dir = %dir.display(), args = ?args, "git");
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
    Ok(GitOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run `git <args>` and fail with its stderr on a non-zero exit.
pub async fn git_checked(dir: &Path, args: &[&str]) -> Result<String> {
    let out = git(dir, args).await?;
    if !out.success {
        bail!("git {} failed: {}", args.join(" "), out.stderr.trim());
    }
    Ok(out.stdout)
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name, without `refs/heads/`.
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
}

/// Parse porcelain worktree listing output.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                ..Default::default()
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(sha) = line.strip_prefix("HEAD ") {
            entry.head = Some(sha.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(
                branch
                    .strip_prefix("refs/heads/")
                    .unwrap_or(branch)
                    .to_string(),
            );
        } else if line == "bare" {
            entry.bare = true;
        } else if line == "detached" {
            entry.detached = true;
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

/// Registered worktrees of the repository at `root`.
pub async fn list_worktrees(root: &Path) -> Result<Vec<WorktreeEntry>> {
    let stdout = git_checked(root, &["worktree", "list", "--porcelain"]).await?;
    Ok(parse_worktree_list(&stdout))
}

/// Register a worktree for `branch` at `path` without checking files out.
pub async fn add_worktree_no_checkout(root: &Path, path: &Path, branch: &str) -> Result<()> {
    let path_str = path
        .to_str()
        .context("Worktree path contains invalid UTF-8")?;
    git_checked(root, &["worktree", "add", "--no-checkout", path_str, branch]).await?;
    Ok(())
}

/// Forcefully unregister and delete a worktree.
pub async fn remove_worktree(root: &Path, path: &Path) -> Result<()> {
    let path_str = path
        .to_str()
        .context("Worktree path contains invalid UTF-8")?;
    git_checked(root, &["worktree", "remove", "--force", path_str]).await?;
    Ok(())
}

/// Result of a non-fast-forward merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { sha: String },
    /// The merge stopped with these unmerged paths; the worktree is left
    /// mid-merge.
    Conflicted { files: Vec<String> },
}

/// Merge `branch` into whatever is checked out in `dir` with `--no-ff`.
pub async fn merge_no_ff(dir: &Path, branch: &str, message: &str) -> Result<MergeOutcome> {
    let out = git(dir, &["merge", "--no-ff", "--no-edit", "-m", message, branch]).await?;
    if out.success {
        let sha = git_checked(dir, &["rev-parse", "HEAD"]).await?;
        return Ok(MergeOutcome::Merged {
            sha: sha.trim().to_string(),
        });
    }

    let files = unmerged_paths(dir).await?;
    if files.is_empty() {
        bail!(
            "git merge {} failed: {}",
            branch,
            format!("{}{}", out.stdout, out.stderr).trim()
        );
    }
    Ok(MergeOutcome::Conflicted { files })
}

/// Paths with unresolved merge conflicts in `dir`.
pub async fn unmerged_paths(dir: &Path) -> Result<Vec<String>> {
    let stdout = git_checked(dir, &["diff", "--name-only", "--diff-filter=U"]).await?;
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Whether `dir` is in the middle of a merge.
pub async fn merge_in_progress(dir: &Path) -> Result<bool> {
    let out = git(dir, &["rev-parse", "-q", "--verify", "MERGE_HEAD"]).await?;
    Ok(out.success)
}

/// Stage everything outside `excluded` and commit. Returns `false` when there
/// was nothing to commit.
pub async fn commit_all(dir: &Path, message: &str, excluded: &[String]) -> Result<bool> {
    let pathspecs: Vec<String> = excluded
        .iter()
        .map(|ex| ex.trim_start_matches("./").trim_end_matches('/'))
        .filter(|ex| !ex.is_empty())
        .map(|ex| format!(":(exclude){}", ex))
        .collect();
    let mut args = vec!["add", "-A", "--", "."];
    args.extend(pathspecs.iter().map(String::as_str));
    git_checked(dir, &args).await?;
    let staged = git(dir, &["diff", "--cached", "--quiet"]).await?;
    if staged.success {
        return Ok(false);
    }
    git_checked(dir, &["commit", "-m", message]).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worktree_list() {
        let output = "\
worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /repo/.orchard/worktrees/api
HEAD 2222222222222222222222222222222222222222
branch refs/heads/plan/api

worktree /tmp/detached
HEAD 3333333333333333333333333333333333333333
detached
";
        let entries = parse_worktree_list(output);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, PathBuf::from("/repo"));
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].branch.as_deref(), Some("plan/api"));
        assert!(entries[2].detached);
        assert!(entries[2].branch.is_none());
    }

    #[test]
    fn test_parse_worktree_list_bare() {
        let entries = parse_worktree_list("worktree /srv/repo.git\nbare\n");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].bare);
    }

    #[tokio::test]
    async fn test_git_reports_failure_without_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let out = git(dir.path(), &["rev-parse", "HEAD"]).await.unwrap();
        assert!(!out.success);
        assert!(git_checked(dir.path(), &["rev-parse", "HEAD"]).await.is_err());
    }
}
