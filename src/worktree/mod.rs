//! Worktree lifecycle: one isolated checkout per spec.
//!
//! Creation registers the worktree without checkout and then checks the
//! branch out with a safe strategy, so untracked content already at the
//! destination survives. Optional `copy_dirs` and a setup script follow; a
//! failure at that point rolls the worktree back unless `keep_on_failure` is
//! set.

mod copy;
mod setup;

pub use copy::copy_dirs;
pub use setup::{SetupContext, resolve_script, run_setup_script};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::WorktreeError;
use crate::git::{self, GitRepo, WorktreeEntry, cli};

/// Subdirectory of the worktree root used for per-layer staging checkouts.
pub const STAGING_DIR: &str = ".staging";

/// Written to a spec worktree's git admin directory once copy, setup and
/// validation have all succeeded.
const PREPARED_MARKER: &str = "orchard-prepared";

/// Creation-time options.
#[derive(Debug, Clone)]
pub struct WorktreeOptions {
    pub copy_dirs: Vec<String>,
    pub setup_script: Option<String>,
    pub setup_timeout: Duration,
    pub keep_on_failure: bool,
}

impl Default for WorktreeOptions {
    fn default() -> Self {
        Self {
            copy_dirs: Vec::new(),
            setup_script: None,
            setup_timeout: Duration::from_secs(300),
            keep_on_failure: false,
        }
    }
}

/// A materialized worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    /// `true` when an existing registration on the expected branch was reused.
    pub reused: bool,
}

/// Removes the in-progress marker when creation finishes either way.
struct CreationGuard {
    name: String,
    creating: Arc<Mutex<HashSet<String>>>,
}

impl Drop for CreationGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.creating.lock() {
            set.remove(&self.name);
        }
    }
}

/// Creates, validates and tears down worktrees under a single root.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    git: GitRepo,
    root: PathBuf,
    options: WorktreeOptions,
    creating: Arc<Mutex<HashSet<String>>>,
}

impl WorktreeManager {
    pub fn new(git: GitRepo, root: PathBuf, options: WorktreeOptions) -> Self {
        Self {
            git,
            root,
            options,
            creating: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn git(&self) -> &GitRepo {
        &self.git
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a spec's worktree lives in.
    pub fn path_for(&self, spec_id: &str) -> PathBuf {
        self.root.join(spec_id)
    }

    /// Directory of a layer's staging worktree.
    pub fn staging_path_for(&self, layer_id: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(layer_id)
    }

    fn begin(&self, name: &str) -> Result<CreationGuard, WorktreeError> {
        let mut set = self
            .creating
            .lock()
            .map_err(|_| WorktreeError::Git("worktree registry lock poisoned".into()))?;
        if !set.insert(name.to_string()) {
            return Err(WorktreeError::CreationInProgress(name.to_string()));
        }
        Ok(CreationGuard {
            name: name.to_string(),
            creating: Arc::clone(&self.creating),
        })
    }

    /// Create (or reuse) the worktree for a spec, run setup and validate it.
    /// A reused worktree is prepared again unless an earlier run finished
    /// preparing it.
    pub async fn create(
        &self,
        spec_id: &str,
        branch: &str,
        base_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<Worktree, WorktreeError> {
        let path = self.path_for(spec_id);
        let (worktree, created_branch) = self.materialize(spec_id, &path, branch, base_ref).await?;
        if worktree.reused {
            if is_prepared(&worktree.path) {
                return Ok(worktree);
            }
            info!(
                spec = spec_id,
                path = %worktree.path.display(),
                "reused worktree was never fully prepared, preparing again"
            );
        }

        if let Err(reason) = self.prepare(&worktree, cancel).await {
            return Err(self.fail(&worktree, created_branch, reason, true).await);
        }

        if self.options.setup_script.is_some()
            && let Err(reason) = self.validate(&worktree.path).await
        {
            return Err(self.fail(&worktree, created_branch, reason, false).await);
        }

        if let Err(e) = mark_prepared(&worktree.path) {
            warn!(spec = spec_id, error = %e, "failed to record prepared worktree");
        }
        info!(spec = spec_id, path = %worktree.path.display(), branch, "worktree ready");
        Ok(worktree)
    }

    /// Create (or reuse) a bare worktree at `path` with no copy or setup step.
    /// Used for staging and final-merge checkouts.
    pub async fn create_plain(
        &self,
        name: &str,
        path: &Path,
        branch: &str,
        base_ref: &str,
    ) -> Result<Worktree, WorktreeError> {
        self.materialize(name, path, branch, base_ref)
            .await
            .map(|(wt, _)| wt)
    }

    /// Duplicate check, branch creation, registration and safe checkout.
    /// Returns the worktree and whether this call created its branch.
    async fn materialize(
        &self,
        name: &str,
        path: &Path,
        branch: &str,
        base_ref: &str,
    ) -> Result<(Worktree, bool), WorktreeError> {
        let _guard = self.begin(name)?;

        if let Some(entry) = self.find_registered(path).await? {
            if entry.branch.as_deref() == Some(branch) && path.exists() {
                debug!(worktree = name, path = %path.display(), "reusing registered worktree");
                return Ok((
                    Worktree {
                        name: name.to_string(),
                        path: path.to_path_buf(),
                        branch: branch.to_string(),
                        reused: true,
                    },
                    false,
                ));
            }
            return Err(WorktreeError::AlreadyExists {
                spec: name.to_string(),
                path: path.to_path_buf(),
            });
        }
        if path.exists() {
            return Err(WorktreeError::AlreadyExists {
                spec: name.to_string(),
                path: path.to_path_buf(),
            });
        }

        let created_branch = if self.git.branch_exists(branch) {
            false
        } else {
            if self.git.resolve_ref(base_ref).map_err(git_err)?.is_none() {
                return Err(WorktreeError::MissingBaseRef(base_ref.to_string()));
            }
            self.git.create_branch(branch, base_ref).map_err(git_err)?;
            true
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorktreeError::Other(e.into()))?;
        }

        let registered = async {
            cli::add_worktree_no_checkout(self.git.root(), path, branch).await?;
            git::safe_checkout(path, branch)
        }
        .await;

        if let Err(e) = registered {
            warn!(worktree = name, error = %e, "worktree registration failed, rolling back");
            self.rollback(path, created_branch.then_some(branch)).await;
            return Err(git_err(e));
        }

        debug!(worktree = name, path = %path.display(), branch, base = base_ref, "worktree registered");
        Ok((
            Worktree {
                name: name.to_string(),
                path: path.to_path_buf(),
                branch: branch.to_string(),
                reused: false,
            },
            created_branch,
        ))
    }

    /// Copy configured directories and run the setup script.
    async fn prepare(&self, worktree: &Worktree, cancel: &CancellationToken) -> Result<(), String> {
        if !self.options.copy_dirs.is_empty() {
            let copied = copy_dirs(self.git.root(), &worktree.path, &self.options.copy_dirs)
                .map_err(|e| format!("{:#}", e))?;
            debug!(spec = %worktree.name, files = copied, "copied untracked directories");
        }

        if let Some(script) = &self.options.setup_script {
            let ctx = SetupContext {
                spec_id: worktree.name.clone(),
                worktree: worktree.path.clone(),
                branch: worktree.branch.clone(),
                source_root: self.git.root().to_path_buf(),
            };
            let command = resolve_script(script, self.git.root());
            run_setup_script(&command, &ctx, self.options.setup_timeout, cancel).await?;
        }
        Ok(())
    }

    /// Post-setup checks: the directory exists, is not the source checkout and
    /// is registered with git.
    async fn validate(&self, path: &Path) -> Result<(), String> {
        if !path.is_dir() {
            return Err(format!("{} does not exist after setup", path.display()));
        }
        if same_path(path, self.git.root()) {
            return Err("worktree path resolves to the source repository".to_string());
        }
        match self.find_registered(path).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(format!("{} is not registered in git worktree list", path.display())),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn fail(
        &self,
        worktree: &Worktree,
        created_branch: bool,
        reason: String,
        setup: bool,
    ) -> WorktreeError {
        let preserved = self.options.keep_on_failure;
        if preserved {
            warn!(
                spec = %worktree.name,
                path = %worktree.path.display(),
                reason = %reason,
                "worktree preparation failed; leaving it in place for debugging"
            );
        } else {
            warn!(spec = %worktree.name, reason = %reason, "worktree preparation failed, rolling back");
            self.rollback(&worktree.path, created_branch.then_some(worktree.branch.as_str()))
                .await;
        }
        if setup {
            WorktreeError::SetupFailed {
                spec: worktree.name.clone(),
                reason,
                preserved,
            }
        } else {
            WorktreeError::ValidationFailed {
                spec: worktree.name.clone(),
                reason,
                preserved,
            }
        }
    }

    /// Forced removal plus branch deletion. Best effort; failures are logged.
    async fn rollback(&self, path: &Path, branch: Option<&str>) {
        if let Err(e) = cli::remove_worktree(self.git.root(), path).await {
            debug!(path = %path.display(), error = %e, "git worktree remove during rollback failed");
        }
        if path.exists()
            && let Err(e) = tokio::fs::remove_dir_all(path).await
        {
            warn!(path = %path.display(), error = %e, "failed to delete worktree directory");
        }
        if let Err(e) = self.git.prune_worktrees() {
            debug!(error = %e, "prune during rollback failed");
        }
        if let Some(branch) = branch
            && let Err(e) = self.git.delete_branch(branch)
        {
            warn!(branch, error = %e, "failed to delete branch during rollback");
        }
    }

    /// Remove a worktree. Without `force`, refuses when it has uncommitted
    /// changes or commits not reachable from its upstream (or `fallback_ref`).
    pub async fn remove(
        &self,
        path: &Path,
        fallback_ref: &str,
        force: bool,
    ) -> Result<(), WorktreeError> {
        if !path.exists() {
            self.git.prune_worktrees().map_err(git_err)?;
            return Err(WorktreeError::NotFound(path.display().to_string()));
        }
        if !force {
            if git::has_uncommitted_changes(path, &self.options.copy_dirs).map_err(git_err)? {
                return Err(WorktreeError::Dirty {
                    path: path.to_path_buf(),
                    reason: "uncommitted changes".to_string(),
                });
            }
            if git::has_unpushed_commits(path, fallback_ref).map_err(git_err)? {
                return Err(WorktreeError::Dirty {
                    path: path.to_path_buf(),
                    reason: format!("commits not merged into {}", fallback_ref),
                });
            }
        }
        cli::remove_worktree(self.git.root(), path)
            .await
            .map_err(git_err)?;
        info!(path = %path.display(), "worktree removed");
        Ok(())
    }

    /// Drop registrations whose directories are gone.
    pub fn prune(&self) -> Result<Vec<String>, WorktreeError> {
        self.git.prune_worktrees().map_err(git_err)
    }

    /// Registered worktrees under this manager's root.
    pub async fn list(&self) -> Result<Vec<WorktreeEntry>, WorktreeError> {
        let root = canonical(&self.root);
        let entries = git::list_worktrees(self.git.root()).await.map_err(git_err)?;
        Ok(entries
            .into_iter()
            .filter(|e| canonical(&e.path).starts_with(&root))
            .collect())
    }

    async fn find_registered(&self, path: &Path) -> Result<Option<WorktreeEntry>, WorktreeError> {
        let entries = git::list_worktrees(self.git.root()).await.map_err(git_err)?;
        Ok(entries.into_iter().find(|e| same_path(&e.path, path)))
    }
}

fn is_prepared(path: &Path) -> bool {
    git::admin_dir(path).is_ok_and(|dir| dir.join(PREPARED_MARKER).is_file())
}

fn mark_prepared(path: &Path) -> anyhow::Result<()> {
    let marker = git::admin_dir(path)?.join(PREPARED_MARKER);
    std::fs::write(&marker, chrono::Utc::now().to_rfc3339())?;
    Ok(())
}

fn git_err(e: anyhow::Error) -> WorktreeError {
    WorktreeError::Git(format!("{:#}", e))
}

/// Canonicalize when possible; otherwise canonicalize the nearest existing
/// ancestor and re-append the rest, so `/tmp` symlinks compare equal.
fn canonical(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => canonical(parent).join(name),
        _ => path.to_path_buf(),
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    canonical(a) == canonical(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{commit_file, setup_repo};
    use std::fs;
    use tempfile::tempdir;

    fn manager(repo: &Path, options: WorktreeOptions) -> WorktreeManager {
        let git = GitRepo::open(repo).unwrap();
        WorktreeManager::new(git, repo.join(".orchard/worktrees"), options)
    }

    #[tokio::test]
    async fn test_create_checks_out_branch_from_base() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let mgr = manager(dir.path(), WorktreeOptions::default());

        let wt = mgr
            .create("api", "plan/api", "main", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!wt.reused);
        assert!(wt.path.join("README.md").exists());
        assert_eq!(git::current_branch(&wt.path).unwrap().as_deref(), Some("plan/api"));
        assert_eq!(mgr.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_reuses_registered_worktree() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let mgr = manager(dir.path(), WorktreeOptions::default());
        let cancel = CancellationToken::new();
        mgr.create("api", "plan/api", "main", &cancel).await.unwrap();
        let again = mgr.create("api", "plan/api", "main", &cancel).await.unwrap();
        assert!(again.reused);
    }

    #[tokio::test]
    async fn test_create_refuses_foreign_directory() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let mgr = manager(dir.path(), WorktreeOptions::default());
        fs::create_dir_all(mgr.path_for("api")).unwrap();
        let err = mgr
            .create("api", "plan/api", "main", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_missing_base_ref() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let mgr = manager(dir.path(), WorktreeOptions::default());
        let err = mgr
            .create("api", "plan/api", "nope", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::MissingBaseRef(_)));
    }

    #[tokio::test]
    async fn test_failed_setup_rolls_back() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let mgr = manager(
            dir.path(),
            WorktreeOptions {
                setup_script: Some("exit 1".into()),
                ..Default::default()
            },
        );
        let err = mgr
            .create("api", "plan/api", "main", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorktreeError::SetupFailed {
                preserved: false,
                ..
            }
        ));
        assert!(!mgr.path_for("api").exists());
        assert!(!mgr.git().branch_exists("plan/api"));
    }

    #[tokio::test]
    async fn test_failed_setup_preserved_when_configured() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let mgr = manager(
            dir.path(),
            WorktreeOptions {
                setup_script: Some("exit 1".into()),
                keep_on_failure: true,
                ..Default::default()
            },
        );
        let err = mgr
            .create("api", "plan/api", "main", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorktreeError::SetupFailed {
                preserved: true,
                ..
            }
        ));
        assert!(mgr.path_for("api").exists());
    }

    #[tokio::test]
    async fn test_kept_failed_worktree_is_prepared_again_on_reuse() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let scratch = tempdir().unwrap();
        let count = scratch.path().join("count");
        let allow = scratch.path().join("allow");
        fs::create_dir_all(dir.path().join(".env.d")).unwrap();
        fs::write(dir.path().join(".env.d/local.env"), "X=1").unwrap();
        let mgr = manager(
            dir.path(),
            WorktreeOptions {
                copy_dirs: vec![".env.d".into()],
                setup_script: Some(format!(
                    "echo run >> '{}' && test -f '{}'",
                    count.display(),
                    allow.display()
                )),
                keep_on_failure: true,
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();
        let err = mgr.create("api", "plan/api", "main", &cancel).await.unwrap_err();
        assert!(matches!(err, WorktreeError::SetupFailed { preserved: true, .. }));
        fs::remove_dir_all(mgr.path_for("api").join(".env.d")).unwrap();

        fs::write(&allow, "").unwrap();
        let wt = mgr.create("api", "plan/api", "main", &cancel).await.unwrap();
        assert!(wt.reused);
        assert!(wt.path.join(".env.d/local.env").exists());
        assert_eq!(fs::read_to_string(&count).unwrap().lines().count(), 2);

        let again = mgr.create("api", "plan/api", "main", &cancel).await.unwrap();
        assert!(again.reused);
        assert_eq!(fs::read_to_string(&count).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn test_successful_setup_and_copy_dirs() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        fs::create_dir_all(dir.path().join(".env.d")).unwrap();
        fs::write(dir.path().join(".env.d/local.env"), "X=1").unwrap();
        let mgr = manager(
            dir.path(),
            WorktreeOptions {
                copy_dirs: vec![".env.d".into()],
                setup_script: Some("touch setup-ran".into()),
                ..Default::default()
            },
        );
        let wt = mgr
            .create("api", "plan/api", "main", &CancellationToken::new())
            .await
            .unwrap();
        assert!(wt.path.join(".env.d/local.env").exists());
        assert!(wt.path.join("setup-ran").exists());
    }

    #[tokio::test]
    async fn test_remove_refuses_dirty_then_forces() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let mgr = manager(dir.path(), WorktreeOptions::default());
        let wt = mgr
            .create("api", "plan/api", "main", &CancellationToken::new())
            .await
            .unwrap();
        fs::write(wt.path.join("scratch.txt"), "wip").unwrap();

        let err = mgr.remove(&wt.path, "main", false).await.unwrap_err();
        assert!(matches!(err, WorktreeError::Dirty { .. }));

        mgr.remove(&wt.path, "main", true).await.unwrap();
        assert!(!wt.path.exists());
    }

    #[tokio::test]
    async fn test_remove_refuses_unmerged_commits() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let mgr = manager(dir.path(), WorktreeOptions::default());
        let wt = mgr
            .create("api", "plan/api", "main", &CancellationToken::new())
            .await
            .unwrap();
        commit_file(&wt.path, "api.rs", "fn api() {}", "api");

        let err = mgr.remove(&wt.path, "main", false).await.unwrap_err();
        assert!(matches!(err, WorktreeError::Dirty { .. }));
    }

    #[tokio::test]
    async fn test_prune_after_manual_delete() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let mgr = manager(dir.path(), WorktreeOptions::default());
        let wt = mgr
            .create("api", "plan/api", "main", &CancellationToken::new())
            .await
            .unwrap();
        fs::remove_dir_all(&wt.path).unwrap();
        let pruned = mgr.prune().unwrap();
        assert_eq!(pruned.len(), 1);
        assert!(mgr.list().await.unwrap().is_empty());
    }
}
