//! `orchard merge`: the final merge into the base branch, and
//! `merge --continue` for a staging merge suspended on a conflict.

use anyhow::Result;
use console::style;
use std::path::Path;

use orchard::dag::continue_suspended;
use orchard::errors::MergeError;
use orchard::exit_codes;
use orchard::staging::{FinalMerge, StagingManager};
use orchard::state::StateStore;

use super::super::Cli;
use super::Project;

fn staging_for(project: &Project) -> Result<StagingManager> {
    let graph = &project.validated.graph;
    Ok(StagingManager::new(
        project.worktrees()?,
        &graph.branch_prefix(),
        &graph.execution().base_branch,
    ))
}

pub async fn cmd_merge(
    cli: &Cli,
    project_dir: &Path,
    definition: &Path,
    branch: Option<&str>,
    skip_failed: bool,
) -> Result<i32> {
    let project = Project::load(project_dir, definition, cli.verbose)?;
    let graph = &project.validated.graph;
    // Holding the writer lock keeps a concurrent run from moving staging.
    let store = StateStore::open(&project.definition)?;
    let staging = staging_for(&project)?;
    let target = branch.unwrap_or(&graph.execution().base_branch);

    match staging
        .final_merge(graph, store.state(), target, skip_failed)
        .await?
    {
        FinalMerge::Merged { sha, workdir } => {
            println!(
                "{} Merged {} into {} ({})",
                style("✓").green(),
                graph
                    .last_layer()
                    .map(|l| staging.staging_branch(&l.id))
                    .unwrap_or_default(),
                target,
                &sha[..sha.len().min(12)]
            );
            println!("  in {}", workdir.display());
            Ok(exit_codes::OK)
        }
        FinalMerge::UpToDate => {
            println!("{} is already up to date.", target);
            Ok(exit_codes::OK)
        }
        FinalMerge::Conflicted { workdir, files } => {
            println!(
                "{} Final merge into {} conflicted in {}:",
                style("!").red().bold(),
                target,
                workdir.display()
            );
            for file in &files {
                println!("  {}", file);
            }
            println!();
            println!("Resolve the files, then `git add` them and `git commit` in that directory.");
            Ok(exit_codes::SUSPENDED)
        }
    }
}

pub async fn cmd_merge_continue(cli: &Cli, project_dir: &Path, definition: &Path) -> Result<i32> {
    let project = Project::load(project_dir, definition, cli.verbose)?;
    let mut store = StateStore::open(&project.definition)?;
    let staging = staging_for(&project)?;

    match continue_suspended(&mut store, &staging).await {
        Ok(done) => {
            println!(
                "{} Merged {} into {} ({})",
                style("✓").green(),
                done.spec,
                staging.staging_branch(&done.layer),
                &done.sha[..done.sha.len().min(12)]
            );
            println!(
                "Run `orchard run {}` to resume.",
                project.definition.display()
            );
            Ok(exit_codes::OK)
        }
        Err(MergeError::Unresolved(files)) => {
            println!(
                "{} Unresolved conflicts remain:",
                style("!").red().bold()
            );
            for file in &files {
                println!("  {}", file);
            }
            println!("Remove every conflict marker and `git add` the files, then retry.");
            Ok(exit_codes::SUSPENDED)
        }
        Err(e) => Err(e.into()),
    }
}
