//! `orchard run`: execute a definition, or print its plan with `--dry-run`.

use anyhow::Result;
use console::style;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orchard::conflict::ConflictResolver;
use orchard::dag::{Orchestrator, RunEvent, RunPaths, RunReport, SchedulerConfig};
use orchard::definition::{Diagnostic, SpecGraph};
use orchard::errors::{DefinitionError, WorktreeError};
use orchard::exec::{Agent, AgentProfile, AgentWorkflow, CommitVerifier, ProcessAgent};
use orchard::exit_codes;
use orchard::staging::spec_branch;
use orchard::state::{RunState, RunStatus, SpecStatus, StateStore, read_snapshot};
use orchard::worktree::WorktreeManager;

use super::super::Cli;
use super::{Project, print_warnings};

/// Flags of `orchard run`.
pub struct RunOptions {
    pub definition: PathBuf,
    pub parallel: bool,
    pub max_parallel: Option<usize>,
    pub fresh: bool,
    pub only: Vec<String>,
    pub clean: bool,
    pub dry_run: bool,
    pub retry: Vec<String>,
    pub fail_fast: bool,
}

impl RunOptions {
    /// Sequential unless `--parallel` or `--max-parallel` is given.
    fn effective_parallel(&self, graph: &SpecGraph) -> usize {
        match (self.max_parallel, self.parallel) {
            (Some(n), _) => n.max(1),
            (None, true) => graph.execution().max_parallel.max(1),
            (None, false) => 1,
        }
    }
}

/// Reject spec ids that are not in the graph.
fn check_ids(graph: &SpecGraph, flag: &str, ids: &[String]) -> Result<(), DefinitionError> {
    let unknown: Vec<Diagnostic> = ids
        .iter()
        .filter(|id| graph.spec(id).is_none())
        .map(|id| Diagnostic::new(None, format!("unknown spec id '{}' in {}", id, flag)))
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(DefinitionError::Invalid(unknown))
    }
}

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<i32> {
    let project = Project::load(project_dir, &options.definition, cli.verbose)?;
    print_warnings(&project.validated.warnings);
    let graph = Arc::new(project.validated.graph.clone());
    check_ids(&graph, "--only", &options.only)?;
    check_ids(&graph, "--retry", &options.retry)?;

    let max_parallel = options.effective_parallel(&graph);
    if options.dry_run {
        let state = read_snapshot(&project.definition)?;
        print_plan(&graph, &state, max_parallel);
        return Ok(exit_codes::OK);
    }

    let mut store = StateStore::open(&project.definition)?;
    let worktrees = project.worktrees()?;
    if options.fresh {
        info!(definition = %project.definition.display(), "discarding persisted run state");
        store.fresh()?;
    }
    if options.clean {
        clean_unfinished(&graph, &mut store, &worktrees).await?;
    }

    let profile = AgentProfile::from_config(&project.config.toml.agent)?;
    let agent: Arc<dyn Agent> = Arc::new(ProcessAgent::new(profile));
    let verifier = CommitVerifier::from_config(&project.config.toml.commit)
        .with_excluded(project.config.toml.worktree.copy_dirs.clone());
    let workflow = Arc::new(AgentWorkflow::new(Arc::clone(&agent), verifier));
    let settings = graph.execution().clone();
    let resolver = ConflictResolver::new(
        settings.conflict_mode,
        Some(agent),
        project.config.toml.merge.resolver_retries,
    );

    let config = SchedulerConfig {
        max_parallel,
        fail_fast: options.fail_fast,
        only: (!options.only.is_empty()).then(|| options.only.iter().cloned().collect::<HashSet<_>>()),
        retry: options.retry.clone(),
        poison_threshold: project.config.toml.scheduler.poison_threshold,
        heartbeat_interval: project.config.heartbeat_interval(),
        stale_grace: project.config.stale_grace(),
        cancel_grace: project.config.cancel_grace(),
        merge_cadence: settings.merge_cadence,
        conflict_mode: settings.conflict_mode,
        default_timeout_minutes: settings.default_timeout_minutes,
    };
    let paths = RunPaths {
        definition: project.definition.clone(),
        log_dir: project.config.log_dir.clone(),
        spec_root: project.config.spec_root(),
    };

    print_header(&graph, &config);
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx));
    let mut orchestrator = Orchestrator::new(
        Arc::clone(&graph),
        store,
        worktrees,
        resolver,
        workflow,
        config,
        paths,
    )
    .with_event_channel(tx);
    let outcome = orchestrator.run(&cancel).await;
    drop(orchestrator);
    let _ = printer.await;

    let report = outcome?;
    print_report(&report, &project.definition);
    Ok(report.exit_code())
}

/// Force-remove worktrees and spec branches of specs that did not complete,
/// and reset them to pending.
async fn clean_unfinished(
    graph: &SpecGraph,
    store: &mut StateStore,
    worktrees: &WorktreeManager,
) -> Result<()> {
    store.ensure_graph(graph)?;
    let prefix = graph.branch_prefix();
    let base = graph.execution().base_branch.clone();
    for spec in graph.specs() {
        let status = store.spec_status(&spec.id);
        if matches!(status, SpecStatus::Completed | SpecStatus::Running) {
            continue;
        }
        let path = store
            .spec(&spec.id)
            .and_then(|s| s.worktree.clone())
            .unwrap_or_else(|| worktrees.path_for(&spec.id));
        match worktrees.remove(&path, &base, true).await {
            Ok(()) | Err(WorktreeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let branch = spec_branch(&prefix, &spec.id);
        if worktrees.git().branch_exists(&branch) {
            worktrees.git().delete_branch(&branch)?;
        }
        store.update_spec(&spec.id, |s| {
            s.reset_for_retry();
            s.worktree = None;
            s.branch = None;
            s.stage = None;
            Ok(())
        })?;
        info!(spec = %spec.id, status = %status, "cleaned unfinished spec");
    }
    worktrees.prune()?;
    Ok(())
}

fn print_plan(graph: &SpecGraph, state: &RunState, max_parallel: usize) {
    let settings = graph.execution();
    println!();
    println!("{}", style("Execution plan (dry run)").bold().cyan());
    println!("─────────────────────────");
    println!("Specs: {}", graph.len());
    println!("Max parallel: {}", max_parallel);
    println!("Base branch: {}", settings.base_branch);
    println!("Branch prefix: {}", graph.branch_prefix());
    println!("Conflict mode: {}", settings.conflict_mode);
    println!("Merge cadence: {}", settings.merge_cadence);
    println!();
    for (layer, waves) in graph.waves() {
        let name = graph
            .layer(&layer)
            .and_then(|l| l.name.clone())
            .map(|n| format!(" ({})", n))
            .unwrap_or_default();
        println!("{}{}", style(format!("Layer {}", layer)).bold(), name);
        for (i, wave) in waves.iter().enumerate() {
            let specs: Vec<String> = wave
                .iter()
                .map(|id| match state.specs.get(id) {
                    Some(s) if s.status != SpecStatus::Pending => format!("{} [{}]", id, s.status),
                    _ => id.clone(),
                })
                .collect();
            println!("  wave {}: {}", i + 1, specs.join(", "));
        }
    }
    println!();
}

fn print_header(graph: &SpecGraph, config: &SchedulerConfig) {
    println!();
    println!("{}", style("Orchard").bold().cyan());
    println!("─────────────────────────");
    println!("Specs: {} in {} layer(s)", graph.len(), graph.layers().len());
    println!("Max parallel: {}", config.max_parallel);
    if config.fail_fast {
        println!("Mode: fail-fast");
    }
    if let Some(only) = &config.only {
        let mut ids: Vec<&String> = only.iter().collect();
        ids.sort();
        println!(
            "Only: {}",
            ids.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        );
    }
    println!();
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<RunEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::Normalized { reset, interrupted } => {
                if !reset.is_empty() {
                    println!("{} reset to pending: {}", style("↺").yellow(), reset.join(", "));
                }
                if !interrupted.is_empty() {
                    println!(
                        "{} interrupted by a previous run: {}",
                        style("↺").yellow(),
                        interrupted.join(", ")
                    );
                }
            }
            RunEvent::SpecStarted {
                spec,
                layer,
                attempt,
            } => {
                let retry = if attempt > 1 {
                    format!(", attempt {}", attempt)
                } else {
                    String::new()
                };
                println!("{} {} ({}{})", style("▶").cyan(), spec, layer, retry);
            }
            RunEvent::StageChanged { spec, stage } => {
                println!("  {} {}: {}", style("·").dim(), spec, style(stage).dim());
            }
            RunEvent::SpecFinished {
                spec,
                status,
                stage,
                reason,
                duration_ms,
            } => {
                let secs = duration_ms as f64 / 1000.0;
                match status {
                    SpecStatus::Completed => {
                        println!("{} {} completed in {:.1}s", style("✓").green(), spec, secs)
                    }
                    SpecStatus::Interrupted => {
                        println!("{} {} interrupted", style("⏸").yellow(), spec)
                    }
                    _ => println!(
                        "{} {} {} at {}: {}",
                        style("✗").red(),
                        spec,
                        status,
                        stage.as_deref().unwrap_or("?"),
                        reason.as_deref().unwrap_or("")
                    ),
                }
            }
            RunEvent::SpecBlocked { spec } => {
                println!("{} {} blocked by a failed dependency", style("⊘").red(), spec)
            }
            RunEvent::SpecReaped { spec } => {
                println!("{} {} lost its owner; will be retried", style("↺").yellow(), spec)
            }
            RunEvent::SpecMerged { spec, layer, .. } => {
                println!("  {} {} merged into staging {}", style("⇢").dim(), spec, layer)
            }
            RunEvent::LayerCompleted {
                layer,
                branch,
                merged,
            } => println!(
                "{} layer {} complete ({} merged into {})",
                style("■").green(),
                layer,
                merged,
                branch
            ),
            RunEvent::ConflictSuspended { spec, layer, .. } => println!(
                "{} merge of {} into layer {} conflicted",
                style("!").red().bold(),
                spec,
                layer
            ),
            RunEvent::CancelRequested { grace_secs } => println!(
                "{} cancelling; in-flight specs have {}s to finish",
                style("!").yellow(),
                grace_secs
            ),
            RunEvent::RunStarted { .. } | RunEvent::RunFinished { .. } => {}
        }
    }
}

fn print_report(report: &RunReport, definition: &Path) {
    let s = &report.summary;
    println!();
    let status = match report.status {
        RunStatus::Completed => style(report.status.to_string()).green().bold(),
        RunStatus::Suspended | RunStatus::Cancelled | RunStatus::Idle => {
            style(report.status.to_string()).yellow().bold()
        }
        _ => style(report.status.to_string()).red().bold(),
    };
    println!("Run {}: {}/{} completed in {:.1}s", status, s.completed, s.total, s.duration.as_secs_f64());
    if s.failed + s.poison + s.blocked + s.interrupted + s.pending > 0 {
        println!(
            "  failed {}  poison {}  blocked {}  interrupted {}  pending {}",
            s.failed, s.poison, s.blocked, s.interrupted, s.pending
        );
    }
    for failure in &report.failures {
        println!(
            "  {} {} [{}] at {}: {}",
            style("✗").red(),
            failure.spec,
            failure.status,
            failure.stage.as_deref().unwrap_or("?"),
            failure.reason.as_deref().unwrap_or("")
        );
    }
    if report.failures.iter().any(|f| f.status == SpecStatus::Poison) {
        println!("  Poisoned specs need `orchard run --retry <ids>` to be scheduled again.");
    }
    if let Some(ctx) = &report.conflict {
        println!();
        println!("{}", ctx.render_manual_block(definition));
    } else if report.status == RunStatus::Completed {
        println!(
            "All layers staged. Run `orchard merge {}` to merge into the base branch.",
            definition.display()
        );
    } else if report.status == RunStatus::Idle && s.pending > 0 {
        warn!(pending = s.pending, "run ended with specs still pending");
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchard::definition::{Definition, ValidateOptions, validate};

    fn graph() -> SpecGraph {
        let def = Definition::parse(
            "execution:\n  max_parallel: 4\nlayers:\n  - id: L0\n    specs:\n      - id: a\n        description: a\n",
        )
        .unwrap();
        validate(&def, &ValidateOptions::default()).unwrap().graph
    }

    fn options() -> RunOptions {
        RunOptions {
            definition: PathBuf::from("plan.yaml"),
            parallel: false,
            max_parallel: None,
            fresh: false,
            only: Vec::new(),
            clean: false,
            dry_run: false,
            retry: Vec::new(),
            fail_fast: false,
        }
    }

    #[test]
    fn test_effective_parallel() {
        let g = graph();
        let mut opts = options();
        assert_eq!(opts.effective_parallel(&g), 1);
        opts.parallel = true;
        assert_eq!(opts.effective_parallel(&g), 4);
        opts.max_parallel = Some(2);
        assert_eq!(opts.effective_parallel(&g), 2);
        opts.parallel = false;
        assert_eq!(opts.effective_parallel(&g), 2);
    }

    #[test]
    fn test_check_ids_rejects_unknown() {
        let g = graph();
        assert!(check_ids(&g, "--only", &["a".to_string()]).is_ok());
        let err = check_ids(&g, "--retry", &["zz".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unknown spec id 'zz' in --retry"));
    }
}
