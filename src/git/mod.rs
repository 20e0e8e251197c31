//! Version-control operations.
//!
//! Read-only queries, branch creation and checkout go through `git2`.
//! Operations libgit2 does not cover well (worktree registration with
//! `--no-checkout`, `--no-ff` merges, whitespace/marker checks) shell out to
//! the `git` CLI in [`cli`].

pub mod cli;

pub use cli::{MergeOutcome, WorktreeEntry, git, git_checked, list_worktrees};

use anyhow::{Context, Result, bail};
use git2::{BranchType, Repository, StatusOptions, build::CheckoutBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Handle on the source repository. Opens the repository per call so it can
/// be shared freely across tasks.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    /// Open the repository containing `path` and remember its main working
    /// directory.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::discover(path)
            .with_context(|| format!("Failed to open git repository at {}", path.display()))?;
        let root = if repo.is_worktree() {
            // commondir is <main>/.git
            repo.commondir()
                .parent()
                .map(Path::to_path_buf)
                .context("Repository common dir has no parent")?
        } else {
            repo.workdir()
                .map(Path::to_path_buf)
                .context("Bare repositories are not supported")?
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.root).context("Failed to open git repository")
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo()
            .map(|r| r.find_branch(name, BranchType::Local).is_ok())
            .unwrap_or(false)
    }

    /// Resolve any revision to a commit SHA; `None` if it does not exist.
    pub fn resolve_ref(&self, rev: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        match repo.revparse_single(rev) {
            Ok(obj) => {
                let commit = obj
                    .peel_to_commit()
                    .with_context(|| format!("'{}' does not point at a commit", rev))?;
                Ok(Some(commit.id().to_string()))
            }
            Err(_) => Ok(None),
        }
    }

    /// Create `name` pointing at `base_ref`. Returns the base commit SHA.
    pub fn create_branch(&self, name: &str, base_ref: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .revparse_single(base_ref)
            .and_then(|o| o.peel_to_commit())
            .with_context(|| format!("Base reference '{}' does not exist", base_ref))?;
        repo.branch(name, &commit, false)
            .with_context(|| format!("Failed to create branch '{}'", name))?;
        debug!(branch = name, base = base_ref, "created branch");
        Ok(commit.id().to_string())
    }

    /// Delete a local branch if it exists.
    pub fn delete_branch(&self, name: &str) -> Result<()> {
        let repo = self.repo()?;
        if let Ok(mut branch) = repo.find_branch(name, BranchType::Local) {
            branch
                .delete()
                .with_context(|| format!("Failed to delete branch '{}'", name))?;
            debug!(branch = name, "deleted branch");
        }
        Ok(())
    }

    /// Whether `ancestor` is reachable from `descendant` (or is the same commit).
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let repo = self.repo()?;
        let a = repo.revparse_single(ancestor)?.peel_to_commit()?.id();
        let d = repo.revparse_single(descendant)?.peel_to_commit()?.id();
        Ok(a == d || repo.graph_descendant_of(d, a)?)
    }

    /// Remove registrations whose directory no longer exists. Returns the
    /// names of pruned worktrees.
    pub fn prune_worktrees(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let names = repo.worktrees()?;
        let mut pruned = Vec::new();
        for name in names.iter().flatten() {
            let Ok(worktree) = repo.find_worktree(name) else {
                continue;
            };
            if worktree.path().exists() {
                continue;
            }
            match worktree.prune(None) {
                Ok(()) => {
                    info!(worktree = name, path = %worktree.path().display(), "pruned orphaned worktree");
                    pruned.push(name.to_string());
                }
                Err(e) => warn!(worktree = name, error = %e, "failed to prune worktree"),
            }
        }
        Ok(pruned)
    }
}

/// Whether `dir` has staged, unstaged or untracked (non-ignored) changes
/// outside the `excluded` paths.
pub fn has_uncommitted_changes(dir: &Path, excluded: &[String]) -> Result<bool> {
    let repo = Repository::open(dir)
        .with_context(|| format!("Failed to open worktree {}", dir.display()))?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(statuses
        .iter()
        .any(|entry| entry.path().is_none_or(|p| !is_excluded(p, excluded))))
}

/// Whether the repository-relative `path` is one of `excluded` or lies
/// beneath one.
fn is_excluded(path: &str, excluded: &[String]) -> bool {
    excluded.iter().any(|ex| {
        let ex = ex.trim_start_matches("./").trim_end_matches('/');
        !ex.is_empty()
            && (path == ex
                || path
                    .strip_prefix(ex)
                    .is_some_and(|rest| rest.starts_with('/')))
    })
}

/// Whether the branch checked out in `dir` has commits not on its upstream,
/// or, without an upstream, not on `fallback_ref`.
pub fn has_unpushed_commits(dir: &Path, fallback_ref: &str) -> Result<bool> {
    let repo = Repository::open(dir)
        .with_context(|| format!("Failed to open worktree {}", dir.display()))?;
    let Ok(head) = repo.head() else {
        return Ok(false);
    };
    let Some(local) = head.target() else {
        return Ok(false);
    };

    let upstream_oid = if head.is_branch() {
        head.shorthand()
            .and_then(|name| repo.find_branch(name, BranchType::Local).ok())
            .and_then(|b| b.upstream().ok())
            .and_then(|u| u.get().target())
    } else {
        None
    };
    let compare = match upstream_oid {
        Some(oid) => oid,
        None => match repo
            .revparse_single(fallback_ref)
            .and_then(|o| o.peel_to_commit())
        {
            Ok(c) => c.id(),
            // Nothing to compare against: treat every commit as unpushed.
            Err(_) => return Ok(true),
        },
    };
    let (ahead, _) = repo.graph_ahead_behind(local, compare)?;
    Ok(ahead > 0)
}

/// SHA of HEAD in `dir`, `None` for an unborn branch.
pub fn head_sha(dir: &Path) -> Result<Option<String>> {
    let repo = Repository::open(dir)
        .with_context(|| format!("Failed to open worktree {}", dir.display()))?;
    Ok(repo
        .head()
        .ok()
        .and_then(|h| h.peel_to_commit().ok())
        .map(|c| c.id().to_string()))
}

/// Commits on HEAD of `dir` that `base` does not contain.
pub fn head_commits_ahead(dir: &Path, base: &str) -> Result<usize> {
    let repo = Repository::open(dir)
        .with_context(|| format!("Failed to open worktree {}", dir.display()))?;
    let Ok(head) = repo.head().and_then(|h| h.peel_to_commit()) else {
        return Ok(0);
    };
    let upstream = repo
        .revparse_single(base)
        .and_then(|o| o.peel_to_commit())
        .with_context(|| format!("Unknown revision '{}'", base))?;
    let (ahead, _) = repo.graph_ahead_behind(head.id(), upstream.id())?;
    Ok(ahead)
}

/// Private git directory of the checkout at `dir` (`.git/worktrees/<name>`
/// for a linked worktree). Files written here never show up as changes.
pub fn admin_dir(dir: &Path) -> Result<PathBuf> {
    let repo = Repository::open(dir)
        .with_context(|| format!("Failed to open worktree {}", dir.display()))?;
    Ok(repo.path().to_path_buf())
}

/// Branch checked out in `dir`, if HEAD is on a branch.
pub fn current_branch(dir: &Path) -> Result<Option<String>> {
    let repo = Repository::open(dir)
        .with_context(|| format!("Failed to open worktree {}", dir.display()))?;
    let head = match repo.head() {
        Ok(h) => h,
        Err(_) => return Ok(None),
    };
    if !head.is_branch() {
        return Ok(None);
    }
    Ok(head.shorthand().map(str::to_string))
}

/// Check out `branch` in `dir` without touching untracked content: files
/// missing from the working tree are recreated, existing untracked files are
/// never removed or overwritten.
pub fn safe_checkout(dir: &Path, branch: &str) -> Result<()> {
    let repo = Repository::open(dir)
        .with_context(|| format!("Failed to open worktree {}", dir.display()))?;
    let refname = format!("refs/heads/{}", branch);
    if repo.find_reference(&refname).is_err() {
        bail!("Branch '{}' does not exist", branch);
    }
    repo.set_head(&refname)
        .with_context(|| format!("Failed to point HEAD at {}", refname))?;
    let mut opts = CheckoutBuilder::new();
    opts.safe().recreate_missing(true);
    repo.checkout_head(Some(&mut opts))
        .with_context(|| format!("Failed to check out '{}' in {}", branch, dir.display()))?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::{commit_file, setup_repo};
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_create_branch_and_resolve() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let git = GitRepo::open(dir.path()).unwrap();
        assert!(!git.branch_exists("feature"));
        let sha = git.create_branch("feature", "main").unwrap();
        assert!(git.branch_exists("feature"));
        assert_eq!(git.resolve_ref("feature").unwrap(), Some(sha));
        assert_eq!(git.resolve_ref("nope").unwrap(), None);
    }

    #[test]
    fn test_create_branch_from_missing_base_fails() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let git = GitRepo::open(dir.path()).unwrap();
        assert!(git.create_branch("x", "does-not-exist").is_err());
    }

    #[test]
    fn test_ancestry() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let git = GitRepo::open(dir.path()).unwrap();
        git.create_branch("base", "main").unwrap();
        commit_file(dir.path(), "a.txt", "a", "add a");
        assert_eq!(head_commits_ahead(dir.path(), "base").unwrap(), 1);
        assert!(git.is_ancestor("base", "main").unwrap());
        assert!(!git.is_ancestor("main", "base").unwrap());
    }

    #[test]
    fn test_uncommitted_changes_detects_untracked() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        assert!(!has_uncommitted_changes(dir.path(), &[]).unwrap());
        fs::write(dir.path().join("new.txt"), "x").unwrap();
        assert!(has_uncommitted_changes(dir.path(), &[]).unwrap());
    }

    #[test]
    fn test_uncommitted_changes_skips_excluded_dirs() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        fs::create_dir_all(dir.path().join(".env.d")).unwrap();
        fs::write(dir.path().join(".env.d/local.env"), "X=1").unwrap();
        let excluded = vec!["./.env.d/".to_string()];
        assert!(!has_uncommitted_changes(dir.path(), &excluded).unwrap());

        fs::write(dir.path().join(".env.dist"), "x").unwrap();
        assert!(has_uncommitted_changes(dir.path(), &excluded).unwrap());
    }

    #[test]
    fn test_unpushed_commits_against_fallback() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let git = GitRepo::open(dir.path()).unwrap();
        git.create_branch("base", "main").unwrap();
        assert!(!has_unpushed_commits(dir.path(), "base").unwrap());
        commit_file(dir.path(), "b.txt", "b", "add b");
        assert!(has_unpushed_commits(dir.path(), "base").unwrap());
    }

    #[test]
    fn test_head_sha_and_current_branch() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        assert_eq!(head_sha(dir.path()).unwrap().map(|s| s.len()), Some(40));
        assert_eq!(current_branch(dir.path()).unwrap().as_deref(), Some("main"));
    }

    #[test]
    fn test_prune_removes_orphaned_registration() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let git = GitRepo::open(dir.path()).unwrap();
        git.create_branch("wt", "main").unwrap();
        let wt_path = dir.path().join("wt-dir");
        let repo = Repository::open(dir.path()).unwrap();
        let branch = repo.find_branch("wt", BranchType::Local).unwrap();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(branch.get()));
        repo.worktree("wt", &wt_path, Some(&opts)).unwrap();
        fs::remove_dir_all(&wt_path).unwrap();

        let pruned = git.prune_worktrees().unwrap();
        assert_eq!(pruned, vec!["wt".to_string()]);
    }
}
