//! `orchard cleanup`: remove spec and staging worktrees.

use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};
use tracing::info;

use orchard::errors::WorktreeError;
use orchard::exit_codes;
use orchard::staging::{FINAL_DIR, staging_branch};
use orchard::state::{MergeStatus, StateStore};
use orchard::worktree::WorktreeManager;

use super::super::Cli;
use super::Project;

/// A worktree cleanup will try to remove.
struct Target {
    path: PathBuf,
    /// Commits reachable from here count as safe.
    fallback_ref: String,
    spec: Option<String>,
    layer: Option<String>,
}

fn targets(project: &Project, store: &StateStore, worktrees: &WorktreeManager) -> Vec<Target> {
    let graph = &project.validated.graph;
    let prefix = graph.branch_prefix();
    let base = graph.execution().base_branch.clone();
    let git = worktrees.git();
    let mut out = Vec::new();

    for spec in graph.specs() {
        let path = store
            .spec(&spec.id)
            .and_then(|s| s.worktree.clone())
            .unwrap_or_else(|| worktrees.path_for(&spec.id));
        let staged = staging_branch(&prefix, &spec.layer);
        out.push(Target {
            path,
            fallback_ref: if git.branch_exists(&staged) { staged } else { base.clone() },
            spec: Some(spec.id.clone()),
            layer: None,
        });
    }
    for layer in graph.layers() {
        // The staging branch outlives its worktree; only dirty state is at risk.
        out.push(Target {
            path: worktrees.staging_path_for(&layer.id),
            fallback_ref: staging_branch(&prefix, &layer.id),
            spec: None,
            layer: Some(layer.id.clone()),
        });
    }
    out.push(Target {
        path: worktrees.root().join(FINAL_DIR),
        fallback_ref: base,
        spec: None,
        layer: None,
    });
    out
}

pub async fn cmd_cleanup(
    cli: &Cli,
    project_dir: &Path,
    definition: &Path,
    force: bool,
) -> Result<i32> {
    let project = Project::load(project_dir, definition, cli.verbose)?;
    let mut store = StateStore::open(&project.definition)?;
    let worktrees = project.worktrees()?;

    let mut removed = 0usize;
    let mut refused = Vec::new();
    for target in targets(&project, &store, &worktrees) {
        if !target.path.exists() {
            continue;
        }
        match worktrees.remove(&target.path, &target.fallback_ref, force).await {
            Ok(()) | Err(WorktreeError::NotFound(_)) => {}
            Err(e @ WorktreeError::Dirty { .. }) => {
                refused.push(e.to_string());
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        removed += 1;
        println!("{} removed {}", style("✓").green(), target.path.display());

        if let Some(spec) = &target.spec
            && store.spec(spec).is_some()
        {
            store.update_spec(spec, |s| {
                s.worktree = None;
                Ok(())
            })?;
        }
        // A staging worktree removed mid-merge takes the merge with it.
        if let Some(layer) = &target.layer
            && let Some(spec) = store.layer(layer).and_then(|l| l.pending_conflict.clone())
        {
            store.update_all(|state| {
                if let Some(l) = state.staging.get_mut(layer) {
                    l.pending_conflict = None;
                }
                if let Some(s) = state.specs.get_mut(&spec) {
                    s.merge_status = MergeStatus::Unmerged;
                }
                Ok(())
            })?;
            info!(layer = %layer, spec = %spec, "dropped suspended merge with its staging worktree");
        }
    }

    let pruned = worktrees.prune()?;
    if !pruned.is_empty() {
        info!(pruned = ?pruned, "pruned stale worktree registrations");
    }

    println!();
    println!("Removed {} worktree(s).", removed);
    if refused.is_empty() {
        return Ok(exit_codes::OK);
    }
    for reason in &refused {
        println!("{} {}", style("✗").red(), reason);
    }
    Ok(exit_codes::FAILED)
}
