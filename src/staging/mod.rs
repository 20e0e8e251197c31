//! Per-layer staging branches and the final merge.
//!
//! Each layer integrates its completed specs into `<prefix>/staging/<layer>`,
//! created from the previous layer's staging branch (the base branch for the
//! first layer). Merges run inside a dedicated staging worktree so the user's
//! own checkout is never touched. The final merge brings the last layer's
//! staging branch into the base branch in one `--no-ff` merge.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::conflict::{ConflictContext, remaining_conflicts};
use crate::definition::SpecGraph;
use crate::errors::{MergeError, StateError};
use crate::git::{self, MergeOutcome, cli};
use crate::state::{RunState, SpecStatus};
use crate::worktree::{Worktree, WorktreeManager};

/// Directory name (under the worktree root) of the temporary final-merge
/// checkout.
pub const FINAL_DIR: &str = ".final";

/// When completed specs are merged into their staging branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeCadence {
    /// As soon as the spec completes and its commit verifies.
    #[default]
    Immediate,
    /// All at once when the layer's specs are terminal.
    Batched,
}

impl std::fmt::Display for MergeCadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeCadence::Immediate => write!(f, "immediate"),
            MergeCadence::Batched => write!(f, "batched"),
        }
    }
}

/// Branch a spec works on.
pub fn spec_branch(prefix: &str, spec_id: &str) -> String {
    format!("{}/spec/{}", prefix, spec_id)
}

/// A layer's integration branch.
pub fn staging_branch(prefix: &str, layer_id: &str) -> String {
    format!("{}/staging/{}", prefix, layer_id)
}

/// Outcome of merging one spec into its staging branch.
#[derive(Debug)]
pub enum SpecMerge {
    Merged { sha: String },
    /// The spec branch is already contained in the staging branch.
    AlreadyMerged,
    /// The staging worktree is left mid-merge.
    Conflicted(ConflictContext),
}

/// Outcome of the final merge.
#[derive(Debug)]
pub enum FinalMerge {
    Merged { sha: String, workdir: PathBuf },
    UpToDate,
    /// Left mid-merge in `workdir` for the operator to finish with git.
    Conflicted { workdir: PathBuf, files: Vec<String> },
}

pub struct StagingManager {
    worktrees: WorktreeManager,
    prefix: String,
    base_branch: String,
}

impl StagingManager {
    pub fn new(worktrees: WorktreeManager, prefix: &str, base_branch: &str) -> Self {
        Self {
            worktrees,
            prefix: prefix.to_string(),
            base_branch: base_branch.to_string(),
        }
    }

    pub fn staging_branch(&self, layer_id: &str) -> String {
        staging_branch(&self.prefix, layer_id)
    }

    pub fn spec_branch(&self, spec_id: &str) -> String {
        spec_branch(&self.prefix, spec_id)
    }

    pub fn staging_path(&self, layer_id: &str) -> PathBuf {
        self.worktrees.staging_path_for(layer_id)
    }

    /// Reference a layer's staging branch (and its specs' branches) start
    /// from.
    pub fn layer_base_ref(&self, graph: &SpecGraph, layer_index: usize) -> String {
        match layer_index.checked_sub(1).and_then(|i| graph.layers().get(i)) {
            Some(prev) => self.staging_branch(&prev.id),
            None => self.base_branch.clone(),
        }
    }

    /// Create (or reuse) a layer's staging branch and worktree. Returns the
    /// worktree and the reference it was created from.
    pub async fn ensure_staging(
        &self,
        graph: &SpecGraph,
        layer_id: &str,
    ) -> Result<(Worktree, String), MergeError> {
        let index = graph
            .layer_index(layer_id)
            .ok_or_else(|| StateError::UnknownLayer(layer_id.to_string()))?;
        let base_ref = self.layer_base_ref(graph, index);
        let branch = self.staging_branch(layer_id);
        let path = self.staging_path(layer_id);
        let worktree = self
            .worktrees
            .create_plain(&format!("staging/{}", layer_id), &path, &branch, &base_ref)
            .await
            .map_err(|e| MergeError::Other(e.into()))?;
        if !worktree.reused {
            info!(layer = layer_id, branch = %branch, base = %base_ref, "staging branch ready");
        }
        Ok((worktree, base_ref))
    }

    /// Merge a spec's branch into its layer's staging branch.
    pub async fn merge_spec(
        &self,
        graph: &SpecGraph,
        spec_id: &str,
    ) -> Result<SpecMerge, MergeError> {
        let spec = graph
            .spec(spec_id)
            .ok_or_else(|| StateError::UnknownSpec(spec_id.to_string()))?;
        let (worktree, _) = self.ensure_staging(graph, &spec.layer).await?;
        let source = self.spec_branch(spec_id);
        let target = self.staging_branch(&spec.layer);

        if cli::merge_in_progress(&worktree.path).await? {
            return Err(MergeError::ConflictPending {
                spec: spec_id.to_string(),
                workdir: worktree.path.clone(),
            });
        }
        if self.worktrees.git().is_ancestor(&source, &target)? {
            debug!(spec = spec_id, layer = %spec.layer, "spec branch already in staging");
            return Ok(SpecMerge::AlreadyMerged);
        }

        let message = format!("orchard: merge {} into {}", spec_id, target);
        match cli::merge_no_ff(&worktree.path, &source, &message).await? {
            MergeOutcome::Merged { sha } => {
                info!(spec = spec_id, layer = %spec.layer, sha = %sha, "merged into staging");
                Ok(SpecMerge::Merged { sha })
            }
            MergeOutcome::Conflicted { files } => {
                warn!(spec = spec_id, layer = %spec.layer, files = ?files, "merge conflict");
                Ok(SpecMerge::Conflicted(ConflictContext::collect(
                    spec_id,
                    &spec.description,
                    &source,
                    &target,
                    &worktree.path,
                    &files,
                )))
            }
        }
    }

    /// Rebuild the context of a merge already suspended in `layer_id`'s
    /// staging worktree.
    pub async fn pending_context(
        &self,
        graph: &SpecGraph,
        layer_id: &str,
        spec_id: &str,
    ) -> Result<ConflictContext, MergeError> {
        let workdir = self.staging_path(layer_id);
        let files = cli::unmerged_paths(&workdir).await?;
        let description = graph
            .spec(spec_id)
            .map(|s| s.description.clone())
            .unwrap_or_default();
        Ok(ConflictContext::collect(
            spec_id,
            &description,
            &self.spec_branch(spec_id),
            &self.staging_branch(layer_id),
            &workdir,
            &files,
        ))
    }

    /// Commit a merge the operator (or resolver) finished in `layer_id`'s
    /// staging worktree. Refuses while unmerged paths or conflict markers
    /// remain.
    pub async fn continue_merge(&self, layer_id: &str) -> Result<String, MergeError> {
        let workdir = self.staging_path(layer_id);
        if !workdir.exists() || !cli::merge_in_progress(&workdir).await? {
            return Err(MergeError::NothingToContinue);
        }
        let staged = cli::git_checked(&workdir, &["diff", "--cached", "--name-only", "HEAD"])
            .await?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        let remaining = remaining_conflicts(&workdir, &staged).await?;
        if !remaining.is_empty() {
            return Err(MergeError::Unresolved(remaining));
        }
        commit_merge(&workdir).await
    }

    /// Merge the last layer's staging branch into `target`.
    ///
    /// Every layer must be complete and, unless `skip_failed`, every spec
    /// completed. The merge runs in the worktree that has `target` checked
    /// out, or in a temporary one under the worktree root.
    pub async fn final_merge(
        &self,
        graph: &SpecGraph,
        state: &RunState,
        target: &str,
        skip_failed: bool,
    ) -> Result<FinalMerge, MergeError> {
        if let Some((layer, spec)) = state.pending_conflict() {
            return Err(MergeError::ConflictPending {
                spec: spec.to_string(),
                workdir: self.staging_path(layer),
            });
        }
        for layer in graph.layers() {
            if !state.layer_complete(&layer.id) {
                return Err(MergeError::LayerIncomplete(layer.id.clone()));
            }
        }
        let unfinished: Vec<String> = graph
            .specs()
            .iter()
            .filter(|s| state.spec_status(&s.id) != SpecStatus::Completed)
            .map(|s| s.id.clone())
            .collect();
        if !unfinished.is_empty() {
            if !skip_failed {
                return Err(MergeError::FailedSpecs(unfinished));
            }
            warn!(skipped = ?unfinished, "final merge skips specs that did not complete");
        }

        let Some(last) = graph.last_layer() else {
            return Ok(FinalMerge::UpToDate);
        };
        let source = self.staging_branch(&last.id);
        let git = self.worktrees.git();
        if !git.branch_exists(target) {
            return Err(MergeError::Other(anyhow::anyhow!(
                "target branch '{}' does not exist",
                target
            )));
        }
        if git.is_ancestor(&source, target)? {
            info!(source = %source, target, "target already contains the staged work");
            return Ok(FinalMerge::UpToDate);
        }

        let (workdir, temporary) = match self.checkout_of(target).await? {
            Some(path) => (path, false),
            None => {
                let path = self.worktrees.root().join(FINAL_DIR);
                let wt = self
                    .worktrees
                    .create_plain("final", &path, target, target)
                    .await
                    .map_err(|e| MergeError::Other(e.into()))?;
                (wt.path, true)
            }
        };

        let message = format!("orchard: merge {} into {}", source, target);
        match cli::merge_no_ff(&workdir, &source, &message).await? {
            MergeOutcome::Merged { sha } => {
                info!(source = %source, target, sha = %sha, "final merge complete");
                if temporary && let Err(e) = cli::remove_worktree(git.root(), &workdir).await {
                    warn!(path = %workdir.display(), error = %e, "failed to remove temporary worktree");
                }
                Ok(FinalMerge::Merged { sha, workdir })
            }
            MergeOutcome::Conflicted { files } => {
                warn!(source = %source, target, files = ?files, "final merge conflicted");
                Ok(FinalMerge::Conflicted { workdir, files })
            }
        }
    }

    /// Worktree path that has `branch` checked out, if any.
    async fn checkout_of(&self, branch: &str) -> Result<Option<PathBuf>, MergeError> {
        let entries = git::list_worktrees(self.worktrees.git().root()).await?;
        Ok(entries
            .into_iter()
            .find(|e| e.branch.as_deref() == Some(branch) && !e.bare)
            .map(|e| e.path))
    }
}

async fn commit_merge(workdir: &Path) -> Result<String, MergeError> {
    let out = cli::git(workdir, &["commit", "--no-edit"]).await?;
    if !out.success {
        return Err(MergeError::Git {
            command: "commit --no-edit".to_string(),
            stderr: format!("{}{}", out.stdout, out.stderr).trim().to_string(),
        });
    }
    let sha = cli::git_checked(workdir, &["rev-parse", "HEAD"]).await?;
    Ok(sha.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Definition, ValidateOptions, validate};
    use crate::git::GitRepo;
    use crate::git::test_support::{commit_file, setup_repo};
    use crate::state::{SpecState, StagingState};
    use crate::worktree::WorktreeOptions;
    use tempfile::tempdir;

    const DEF: &str = "\
metadata:
  id: plan
layers:
  - id: L0
    specs:
      - id: a
        description: First
      - id: b
        description: Second
  - id: L1
    specs:
      - id: c
        description: Third
        depends_on: [a]
";

    fn graph() -> SpecGraph {
        let def = Definition::parse(DEF).unwrap();
        validate(&def, &ValidateOptions::default()).unwrap().graph
    }

    fn manager(repo: &Path) -> StagingManager {
        let git = GitRepo::open(repo).unwrap();
        let wt = WorktreeManager::new(git, repo.join(".orchard/worktrees"), WorktreeOptions::default());
        StagingManager::new(wt, "plan", "main")
    }

    fn ignore_orchard(repo: &Path) {
        commit_file(repo, ".gitignore", ".orchard/\n", "ignore orchard");
    }

    /// Create a spec branch from `base` with one commit touching `file`.
    async fn spec_commit(repo: &Path, branch: &str, base: &str, file: &str, content: &str) {
        cli::git_checked(repo, &["branch", branch, base]).await.unwrap();
        let tmp = repo.join(".orchard/tmp").join(branch.replace('/', "-"));
        let tmp_str = tmp.to_str().unwrap().to_string();
        cli::git_checked(repo, &["worktree", "add", &tmp_str, branch]).await.unwrap();
        commit_file(&tmp, file, content, &format!("work on {}", branch));
        cli::remove_worktree(repo, &tmp).await.unwrap();
    }

    #[test]
    fn test_branch_names() {
        assert_eq!(spec_branch("plan", "api"), "plan/spec/api");
        assert_eq!(staging_branch("plan", "L0"), "plan/staging/L0");
    }

    #[tokio::test]
    async fn test_layer_base_refs_chain() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let mgr = manager(dir.path());
        let g = graph();
        assert_eq!(mgr.layer_base_ref(&g, 0), "main");
        assert_eq!(mgr.layer_base_ref(&g, 1), "plan/staging/L0");
    }

    #[tokio::test]
    async fn test_merge_spec_then_already_merged() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        ignore_orchard(dir.path());
        let mgr = manager(dir.path());
        let g = graph();
        spec_commit(dir.path(), "plan/spec/a", "main", "a.txt", "a\n").await;

        match mgr.merge_spec(&g, "a").await.unwrap() {
            SpecMerge::Merged { sha } => assert_eq!(sha.len(), 40),
            other => panic!("expected merge, got {:?}", other),
        }
        assert!(mgr.staging_path("L0").join("a.txt").exists());
        assert!(matches!(
            mgr.merge_spec(&g, "a").await.unwrap(),
            SpecMerge::AlreadyMerged
        ));
    }

    #[tokio::test]
    async fn test_conflict_then_continue() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        ignore_orchard(dir.path());
        let mgr = manager(dir.path());
        let g = graph();
        spec_commit(dir.path(), "plan/spec/a", "main", "shared.txt", "from a\n").await;
        spec_commit(dir.path(), "plan/spec/b", "main", "shared.txt", "from b\n").await;

        assert!(matches!(mgr.merge_spec(&g, "a").await.unwrap(), SpecMerge::Merged { .. }));
        let ctx = match mgr.merge_spec(&g, "b").await.unwrap() {
            SpecMerge::Conflicted(ctx) => ctx,
            other => panic!("expected conflict, got {:?}", other),
        };
        assert_eq!(ctx.paths(), vec!["shared.txt".to_string()]);
        assert_eq!(ctx.description, "Second");

        // Markers still present.
        assert!(matches!(
            mgr.continue_merge("L0").await.unwrap_err(),
            MergeError::Unresolved(_)
        ));

        let staging = mgr.staging_path("L0");
        std::fs::write(staging.join("shared.txt"), "from a and b\n").unwrap();
        cli::git_checked(&staging, &["add", "shared.txt"]).await.unwrap();
        let sha = mgr.continue_merge("L0").await.unwrap();
        assert_eq!(sha.len(), 40);
        assert!(matches!(
            mgr.continue_merge("L0").await.unwrap_err(),
            MergeError::NothingToContinue
        ));
    }

    #[tokio::test]
    async fn test_next_layer_staging_starts_from_previous() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        ignore_orchard(dir.path());
        let mgr = manager(dir.path());
        let g = graph();
        spec_commit(dir.path(), "plan/spec/a", "main", "a.txt", "a\n").await;
        mgr.merge_spec(&g, "a").await.unwrap();

        let (wt, base) = mgr.ensure_staging(&g, "L1").await.unwrap();
        assert_eq!(base, "plan/staging/L0");
        assert!(wt.path.join("a.txt").exists());
    }

    fn finished_state(statuses: &[(&str, SpecStatus)]) -> RunState {
        let mut state = RunState::default();
        for (id, status) in statuses {
            state.specs.insert(
                id.to_string(),
                SpecState {
                    status: *status,
                    ..Default::default()
                },
            );
        }
        for layer in ["L0", "L1"] {
            state.staging.insert(
                layer.to_string(),
                StagingState {
                    complete: true,
                    ..Default::default()
                },
            );
        }
        state
    }

    #[tokio::test]
    async fn test_final_merge_requirements() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        let mgr = manager(dir.path());
        let g = graph();

        let mut state = finished_state(&[
            ("a", SpecStatus::Completed),
            ("b", SpecStatus::Failed),
            ("c", SpecStatus::Completed),
        ]);
        state.staging.get_mut("L1").unwrap().complete = false;
        assert!(matches!(
            mgr.final_merge(&g, &state, "main", false).await.unwrap_err(),
            MergeError::LayerIncomplete(l) if l == "L1"
        ));

        state.staging.get_mut("L1").unwrap().complete = true;
        match mgr.final_merge(&g, &state, "main", false).await.unwrap_err() {
            MergeError::FailedSpecs(ids) => assert_eq!(ids, vec!["b".to_string()]),
            other => panic!("unexpected error {:?}", other),
        }

        state.staging.get_mut("L0").unwrap().pending_conflict = Some("b".into());
        assert!(matches!(
            mgr.final_merge(&g, &state, "main", true).await.unwrap_err(),
            MergeError::ConflictPending { .. }
        ));
    }

    #[tokio::test]
    async fn test_final_merge_into_checked_out_base() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        ignore_orchard(dir.path());
        let mgr = manager(dir.path());
        let g = graph();
        spec_commit(dir.path(), "plan/spec/a", "main", "a.txt", "a\n").await;
        mgr.merge_spec(&g, "a").await.unwrap();
        mgr.ensure_staging(&g, "L1").await.unwrap();

        let state = finished_state(&[
            ("a", SpecStatus::Completed),
            ("b", SpecStatus::Completed),
            ("c", SpecStatus::Completed),
        ]);
        match mgr.final_merge(&g, &state, "main", false).await.unwrap() {
            FinalMerge::Merged { workdir, .. } => {
                assert_eq!(workdir.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
            }
            other => panic!("expected merge, got {:?}", other),
        }
        assert!(dir.path().join("a.txt").exists());
        assert!(matches!(
            mgr.final_merge(&g, &state, "main", false).await.unwrap(),
            FinalMerge::UpToDate
        ));
    }

    #[tokio::test]
    async fn test_final_merge_uses_temporary_worktree_for_other_target() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        ignore_orchard(dir.path());
        cli::git_checked(dir.path(), &["branch", "release"]).await.unwrap();
        let mgr = manager(dir.path());
        let g = graph();
        spec_commit(dir.path(), "plan/spec/a", "main", "a.txt", "a\n").await;
        mgr.merge_spec(&g, "a").await.unwrap();
        mgr.ensure_staging(&g, "L1").await.unwrap();

        let state = finished_state(&[
            ("a", SpecStatus::Completed),
            ("b", SpecStatus::Completed),
            ("c", SpecStatus::Completed),
        ]);
        assert!(matches!(
            mgr.final_merge(&g, &state, "release", false).await.unwrap(),
            FinalMerge::Merged { .. }
        ));
        assert!(!dir.path().join(".orchard/worktrees").join(FINAL_DIR).exists());
        let git = GitRepo::open(dir.path()).unwrap();
        assert!(git.is_ancestor("plan/staging/L1", "release").unwrap());
        assert!(!git::has_uncommitted_changes(dir.path(), &[]).unwrap());
    }
}
