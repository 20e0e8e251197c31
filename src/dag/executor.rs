//! The orchestrator loop.
//!
//! Owns the [`StateStore`] for the whole run. Spec tasks run on the tokio
//! pool, bounded by a semaphore, and report stage changes and outcomes back
//! over an mpsc channel; only this loop writes state. After every message the
//! ready set is recomputed, blocked specs are propagated, completed specs are
//! merged into their layer's staging branch and settled layers are closed.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Instant, Interval, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conflict::{ConflictContext, ConflictResolver, Resolution};
use crate::dag::scheduler::{
    SchedulerConfig, layer_open, layer_settled, normalize_for_run, propagate_blocked, reap_stale,
    ready_set,
};
use crate::dag::state::{ExecutionTimer, RunReport, RunSummary};
use crate::definition::SpecGraph;
use crate::errors::MergeError;
use crate::exec::{EXECUTION_STAGE, SpecOutcome, SpecRequest, SpecResult, WorkflowExecutor};
use crate::staging::{MergeCadence, SpecMerge, StagingManager};
use crate::state::{LockRecord, MergeStatus, RunState, RunStatus, SpecStatus, StateStore};
use crate::worktree::WorktreeManager;

/// Stage recorded when a spec's worktree could not be created.
pub const WORKTREE_SETUP_STAGE: &str = "worktree-setup";

/// Events emitted during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        owner: String,
        max_parallel: usize,
    },
    /// Start-of-run normalisation changed persisted state.
    Normalized {
        reset: Vec<String>,
        interrupted: Vec<String>,
    },
    SpecStarted {
        spec: String,
        layer: String,
        attempt: u32,
    },
    StageChanged {
        spec: String,
        stage: String,
    },
    SpecFinished {
        spec: String,
        status: SpecStatus,
        stage: Option<String>,
        reason: Option<String>,
        duration_ms: u64,
    },
    SpecBlocked {
        spec: String,
    },
    /// A spec whose heartbeat went stale was converted to interrupted.
    SpecReaped {
        spec: String,
    },
    SpecMerged {
        spec: String,
        layer: String,
        sha: Option<String>,
    },
    LayerCompleted {
        layer: String,
        branch: String,
        merged: usize,
    },
    ConflictSuspended {
        spec: String,
        layer: String,
        files: Vec<String>,
        workdir: PathBuf,
    },
    CancelRequested {
        grace_secs: u64,
    },
    RunFinished {
        status: RunStatus,
        summary: RunSummary,
    },
}

/// Filesystem locations a run needs besides the repository.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub definition: PathBuf,
    /// Per-spec agent logs land here as `<id>.log`.
    pub log_dir: PathBuf,
    /// Spec content folders live at `<spec_root>/<id>`.
    pub spec_root: PathBuf,
}

/// Messages from spec tasks to the orchestrator loop.
#[derive(Debug)]
enum TaskMessage {
    Stage { spec: String, stage: String },
    Finished { spec: String, result: SpecResult },
}

/// What woke the loop.
enum Wake {
    Message(Option<TaskMessage>),
    Heartbeat,
    Cancel,
    GraceExpired,
}

/// Heartbeat timer and the specs it keeps alive, lent to long merges so
/// in-flight locks stay fresh while the loop is not polling.
struct Pulse<'a> {
    ticker: &'a mut Interval,
    in_flight: &'a HashSet<String>,
}

/// A merge finished by `merge --continue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuedMerge {
    pub layer: String,
    pub spec: String,
    pub sha: String,
}

pub struct Orchestrator<W: WorkflowExecutor> {
    graph: Arc<SpecGraph>,
    store: StateStore,
    worktrees: WorktreeManager,
    staging: StagingManager,
    resolver: ConflictResolver,
    executor: Arc<W>,
    config: SchedulerConfig,
    paths: RunPaths,
    owner: String,
    event_tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl<W: WorkflowExecutor> Orchestrator<W> {
    pub fn new(
        graph: Arc<SpecGraph>,
        store: StateStore,
        worktrees: WorktreeManager,
        resolver: ConflictResolver,
        executor: Arc<W>,
        config: SchedulerConfig,
        paths: RunPaths,
    ) -> Self {
        let staging = StagingManager::new(
            worktrees.clone(),
            &graph.branch_prefix(),
            &graph.execution().base_branch,
        );
        Self {
            graph,
            store,
            worktrees,
            staging,
            resolver,
            executor,
            config,
            paths,
            owner: uuid::Uuid::new_v4().to_string(),
            event_tx: None,
        }
    }

    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Release the state document.
    pub fn into_store(self) -> StateStore {
        self.store
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Drive the run until nothing is runnable, the run suspends on a
    /// conflict, or `cancel` trips and in-flight specs have wound down.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunReport> {
        let timer = ExecutionTimer::start();
        if let Some((layer, spec)) = self.store.state().pending_conflict() {
            let (layer, spec) = (layer.to_string(), spec.to_string());
            warn!(spec = %spec, layer = %layer, "a merge is still waiting on a conflict resolution");
            let ctx = self
                .staging
                .pending_context(&self.graph, &layer, &spec)
                .await?;
            self.store.update_run(|run| run.status = RunStatus::Suspended)?;
            return Ok(RunReport {
                status: RunStatus::Suspended,
                summary: RunSummary::from_state(&self.graph, self.store.state()),
                failures: RunReport::failures_from_state(&self.graph, self.store.state()),
                conflict: Some(ctx),
            });
        }

        self.store.ensure_graph(&self.graph)?;
        let graph = Arc::clone(&self.graph);
        let owner = self.owner.clone();
        let config = self.config.clone();
        let now = Utc::now();
        let normalized = self
            .store
            .update_all(|state| normalize_for_run(&graph, state, &owner, now, &config))?;
        if !normalized.reset.is_empty() || !normalized.interrupted.is_empty() {
            info!(
                reset = ?normalized.reset,
                interrupted = ?normalized.interrupted,
                "normalised run state"
            );
            self.emit(RunEvent::Normalized {
                reset: normalized.reset,
                interrupted: normalized.interrupted,
            });
        }
        self.store.update_run(|run| {
            run.status = RunStatus::Running;
            run.owner = Some(owner.clone());
            run.started_at = Some(now);
            run.finished_at = None;
        })?;
        tokio::fs::create_dir_all(&self.paths.log_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.paths.log_dir.display()))?;
        info!(owner = %self.owner, max_parallel = self.config.max_parallel, specs = graph.len(), "run started");
        self.emit(RunEvent::RunStarted {
            owner: self.owner.clone(),
            max_parallel: self.config.max_parallel,
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<TaskMessage>();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let task_cancel = CancellationToken::new();
        let mut heartbeat =
            tokio::time::interval(self.config.heartbeat_interval.max(Duration::from_secs(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let mut in_flight: HashSet<String> = HashSet::new();
        let mut grace_deadline: Option<Instant> = None;
        let mut stop_dispatch = false;
        let mut suspended: Option<ConflictContext> = None;
        let mut failure: Option<anyhow::Error> = None;

        loop {
            if failure.is_none() && suspended.is_none() {
                let mut pulse = Pulse {
                    ticker: &mut heartbeat,
                    in_flight: &in_flight,
                };
                match self.settle(cancel, &mut pulse).await {
                    Ok(Some(ctx)) => suspended = Some(ctx),
                    Ok(None) => {}
                    Err(e) => halt(&mut failure, e, &task_cancel),
                }
            }
            let dispatching = failure.is_none()
                && suspended.is_none()
                && !stop_dispatch
                && !cancel.is_cancelled();
            if dispatching
                && let Err(e) = self.dispatch(&mut in_flight, &semaphore, &tx, &task_cancel)
            {
                halt(&mut failure, e, &task_cancel);
            }
            if in_flight.is_empty() {
                break;
            }

            let wake = tokio::select! {
                msg = rx.recv() => Wake::Message(msg),
                _ = heartbeat.tick() => Wake::Heartbeat,
                _ = cancel.cancelled(), if grace_deadline.is_none() => Wake::Cancel,
                _ = sleep_until(grace_deadline.unwrap_or_else(Instant::now)),
                    if grace_deadline.is_some() && !task_cancel.is_cancelled() => Wake::GraceExpired,
            };

            match wake {
                Wake::Message(Some(TaskMessage::Stage { spec, stage })) => {
                    if let Err(e) = self.record_stage(&spec, &stage) {
                        warn!(spec = %spec, error = %e, "failed to record stage");
                    }
                }
                Wake::Message(Some(TaskMessage::Finished { spec, result })) => {
                    in_flight.remove(&spec);
                    match self.record_result(&spec, &result) {
                        Ok(status) if status.blocks_dependents() && self.config.fail_fast => {
                            if !stop_dispatch {
                                warn!(spec = %spec, "fail-fast: no further specs will be dispatched");
                            }
                            stop_dispatch = true;
                        }
                        Ok(_) => {}
                        Err(e) => halt(&mut failure, e, &task_cancel),
                    }
                }
                Wake::Message(None) => break,
                Wake::Heartbeat => {
                    if let Err(e) = self.heartbeat(&in_flight) {
                        warn!(error = %e, "heartbeat failed");
                    }
                }
                Wake::Cancel => {
                    let grace = self.config.cancel_grace;
                    warn!(in_flight = in_flight.len(), grace_secs = grace.as_secs(), "cancellation requested");
                    self.emit(RunEvent::CancelRequested {
                        grace_secs: grace.as_secs(),
                    });
                    grace_deadline = Some(Instant::now() + grace);
                }
                Wake::GraceExpired => {
                    warn!(in_flight = in_flight.len(), "grace window elapsed; stopping in-flight specs");
                    task_cancel.cancel();
                }
            }
        }

        self.release_leftovers()?;
        let status = if failure.is_some() {
            RunStatus::Failed
        } else if suspended.is_some() {
            RunStatus::Suspended
        } else if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            self.final_status()
        };
        self.store.update_run(|run| {
            run.status = status;
            run.finished_at = Some(Utc::now());
        })?;

        let mut summary = RunSummary::from_state(&self.graph, self.store.state());
        summary.duration = timer.elapsed();
        info!(status = %status, completed = summary.completed, total = summary.total, "run finished");
        self.emit(RunEvent::RunFinished {
            status,
            summary: summary.clone(),
        });

        if let Some(e) = failure {
            return Err(e);
        }
        Ok(RunReport {
            status,
            failures: RunReport::failures_from_state(&self.graph, self.store.state()),
            summary,
            conflict: suspended,
        })
    }

    /// Mark ready specs running and spawn their tasks, up to the parallel
    /// bound.
    fn dispatch(
        &mut self,
        in_flight: &mut HashSet<String>,
        semaphore: &Arc<Semaphore>,
        tx: &mpsc::UnboundedSender<TaskMessage>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        for id in ready_set(&graph, self.store.state(), self.config.only.as_ref()) {
            if in_flight.len() >= self.config.max_parallel.max(1) {
                break;
            }
            let Some(spec) = graph.spec(&id) else {
                continue;
            };
            let branch = self.staging.spec_branch(&id);
            let base_ref = self.staging.layer_base_ref(&graph, spec.layer_index);
            let workdir = self.worktrees.path_for(&id);
            let now = Utc::now();
            let owner = self.owner.clone();
            let attempt = self.store.update_spec(&id, |s| {
                s.transition(&id, SpecStatus::Running)?;
                s.worktree = Some(workdir.clone());
                s.branch = Some(branch.clone());
                s.started_at = Some(now);
                s.finished_at = None;
                s.stage = None;
                s.merge_status = MergeStatus::Unmerged;
                s.lock = Some(LockRecord::new(&owner, now));
                s.attempts += 1;
                Ok(s.attempts)
            })?;

            info!(spec = %id, layer = %spec.layer, branch = %branch, base = %base_ref, attempt, "dispatching spec");
            self.emit(RunEvent::SpecStarted {
                spec: id.clone(),
                layer: spec.layer.clone(),
                attempt,
            });

            let minutes = spec
                .timeout_minutes
                .unwrap_or(self.config.default_timeout_minutes);
            let request = SpecRequest {
                spec_id: id.clone(),
                description: spec.description.clone(),
                content_dir: self.paths.spec_root.join(&id),
                workdir,
                branch,
                base_ref,
                timeout: Duration::from_secs(minutes.saturating_mul(60)),
                log_file: self.paths.log_dir.join(format!("{}.log", id)),
            };
            in_flight.insert(id.clone());
            tokio::spawn(run_spec(SpecTask {
                request,
                worktrees: self.worktrees.clone(),
                executor: Arc::clone(&self.executor),
                semaphore: Arc::clone(semaphore),
                tx: tx.clone(),
                cancel: cancel.clone(),
            }));
        }
        Ok(())
    }

    /// Propagate blocks, merge what is mergeable and close settled layers.
    /// Returns the conflict context when a merge needs the operator.
    async fn settle(
        &mut self,
        cancel: &CancellationToken,
        pulse: &mut Pulse<'_>,
    ) -> Result<Option<ConflictContext>> {
        let graph = Arc::clone(&self.graph);
        let mut next = self.store.state().clone();
        let blocked = propagate_blocked(&graph, &mut next);
        if !blocked.is_empty() {
            self.store.update_all(|state| {
                *state = next;
                Ok(())
            })?;
            for id in blocked {
                info!(spec = %id, "spec blocked by a failed dependency");
                self.emit(RunEvent::SpecBlocked { spec: id });
            }
        }

        for (index, layer) in graph.layers().iter().enumerate() {
            let state = self.store.state();
            if !layer_open(&graph, state, index) {
                break;
            }
            if state.layer_complete(&layer.id) {
                continue;
            }
            let settled = layer_settled(&graph, state, &layer.id);
            if (settled || self.config.merge_cadence == MergeCadence::Immediate)
                && let Some(ctx) = self.merge_completed(&layer.id, cancel, pulse).await?
            {
                return Ok(Some(ctx));
            }
            if !settled {
                break;
            }
            self.complete_layer(&layer.id).await?;
        }
        Ok(None)
    }

    /// Merge every completed, unmerged spec of a layer into its staging
    /// branch, in declaration order.
    async fn merge_completed(
        &mut self,
        layer_id: &str,
        cancel: &CancellationToken,
        pulse: &mut Pulse<'_>,
    ) -> Result<Option<ConflictContext>> {
        let graph = Arc::clone(&self.graph);
        for spec_id in graph.specs_in_layer(layer_id) {
            let state = self.store.state();
            let merged = state
                .staging
                .get(layer_id)
                .is_some_and(|s| s.is_merged(spec_id));
            if merged || state.spec_status(spec_id) != SpecStatus::Completed {
                continue;
            }

            let merge = self.staging.merge_spec(&graph, spec_id);
            let ctx = match keep_alive(&mut self.store, &self.owner, pulse, merge).await? {
                SpecMerge::Merged { sha } => {
                    self.mark_merged(layer_id, spec_id, Some(sha))?;
                    continue;
                }
                SpecMerge::AlreadyMerged => {
                    self.mark_merged(layer_id, spec_id, None)?;
                    continue;
                }
                SpecMerge::Conflicted(ctx) => ctx,
            };

            self.store.update_all(|state| {
                if let Some(s) = state.specs.get_mut(spec_id) {
                    s.merge_status = MergeStatus::Conflicted;
                }
                if let Some(l) = state.staging.get_mut(layer_id) {
                    l.pending_conflict = Some(spec_id.clone());
                }
                Ok(())
            })?;

            let resolution = self.resolver.resolve(ctx, cancel);
            match keep_alive(&mut self.store, &self.owner, pulse, resolution).await? {
                Resolution::Resolved => {
                    let finish = self.staging.continue_merge(layer_id);
                    let sha = keep_alive(&mut self.store, &self.owner, pulse, finish).await?;
                    self.mark_merged(layer_id, spec_id, Some(sha))?;
                }
                Resolution::Manual(ctx) => {
                    warn!(spec = %spec_id, layer = layer_id, files = ?ctx.paths(), "merge suspended on conflict");
                    self.emit(RunEvent::ConflictSuspended {
                        spec: spec_id.clone(),
                        layer: layer_id.to_string(),
                        files: ctx.paths(),
                        workdir: ctx.workdir.clone(),
                    });
                    return Ok(Some(ctx));
                }
            }
        }
        Ok(None)
    }

    fn mark_merged(&mut self, layer_id: &str, spec_id: &str, sha: Option<String>) -> Result<()> {
        self.store.update_all(|state| {
            record_merged(state, layer_id, spec_id);
            Ok(())
        })?;
        self.emit(RunEvent::SpecMerged {
            spec: spec_id.to_string(),
            layer: layer_id.to_string(),
            sha,
        });
        Ok(())
    }

    async fn complete_layer(&mut self, layer_id: &str) -> Result<()> {
        let (_, base_ref) = self.staging.ensure_staging(&self.graph, layer_id).await?;
        let branch = self.staging.staging_branch(layer_id);
        let merged = self.store.update_layer(layer_id, |s| {
            s.branch = Some(branch.clone());
            s.base_ref = Some(base_ref.clone());
            s.complete = true;
            Ok(s.merged.len())
        })?;
        info!(layer = layer_id, branch = %branch, merged, "layer complete");
        self.emit(RunEvent::LayerCompleted {
            layer: layer_id.to_string(),
            branch,
            merged,
        });
        Ok(())
    }

    fn record_stage(&mut self, spec_id: &str, stage: &str) -> Result<()> {
        self.store.update_spec(spec_id, |s| {
            s.stage = Some(stage.to_string());
            Ok(())
        })?;
        debug!(spec = spec_id, stage, "stage changed");
        self.emit(RunEvent::StageChanged {
            spec: spec_id.to_string(),
            stage: stage.to_string(),
        });
        Ok(())
    }

    fn record_result(&mut self, spec_id: &str, result: &SpecResult) -> Result<SpecStatus> {
        let now = Utc::now();
        let threshold = self.config.poison_threshold;
        let duration_ms = result.duration.as_millis() as u64;
        let status = self.store.update_spec(spec_id, |s| {
            s.duration_ms = Some(duration_ms);
            s.commit_status = result.commit_status;
            if result.last_stage.is_some() {
                s.stage = result.last_stage.clone();
            }
            match &result.outcome {
                SpecOutcome::Completed => {
                    s.transition(spec_id, SpecStatus::Completed)?;
                    s.finished_at = Some(now);
                    s.lock = None;
                    s.commit_sha = result.commit_sha.clone();
                    s.consecutive_failures = 0;
                    s.failed_stage = None;
                    s.failure_reason = None;
                    Ok(SpecStatus::Completed)
                }
                SpecOutcome::Failed { stage, reason } => {
                    s.record_failure(spec_id, stage, reason, threshold, now)
                }
                SpecOutcome::Interrupted => {
                    s.transition(spec_id, SpecStatus::Interrupted)?;
                    s.lock = None;
                    Ok(SpecStatus::Interrupted)
                }
            }
        })?;

        let (stage, reason) = match &result.outcome {
            SpecOutcome::Failed { stage, reason } => (Some(stage.clone()), Some(reason.clone())),
            _ => (result.last_stage.clone(), None),
        };
        match status {
            SpecStatus::Completed => {
                info!(spec = spec_id, duration_ms, "spec completed")
            }
            SpecStatus::Poison => {
                error!(spec = spec_id, stage = ?stage, reason = ?reason, "spec poisoned after repeated failures")
            }
            SpecStatus::Interrupted => warn!(spec = spec_id, "spec interrupted"),
            _ => warn!(spec = spec_id, stage = ?stage, reason = ?reason, "spec failed"),
        }
        self.emit(RunEvent::SpecFinished {
            spec: spec_id.to_string(),
            status,
            stage,
            reason,
            duration_ms,
        });
        Ok(status)
    }

    /// Refresh our locks and reap running specs nobody is heartbeating.
    fn heartbeat(&mut self, in_flight: &HashSet<String>) -> Result<()> {
        let now = Utc::now();
        let grace = self.config.stale_grace;
        let owner = self.owner.clone();
        let reaped = self.store.update_all(|state| {
            refresh_locks(state, in_flight, &owner, now);
            Ok(reap_stale(state, in_flight, now, grace))
        })?;
        for id in reaped {
            warn!(spec = %id, "stale heartbeat; spec interrupted");
            self.emit(RunEvent::SpecReaped { spec: id });
        }
        Ok(())
    }

    /// Specs still marked running under this owner after the loop ends are
    /// interrupted.
    fn release_leftovers(&mut self) -> Result<()> {
        let owner = self.owner.clone();
        let released = self.store.update_all(|state| {
            let mut released = Vec::new();
            for (id, s) in state.specs.iter_mut() {
                let ours = s.lock.as_ref().is_some_and(|l| l.owner == owner);
                if s.status == SpecStatus::Running && ours {
                    s.status = SpecStatus::Interrupted;
                    s.lock = None;
                    released.push(id.clone());
                }
            }
            Ok(released)
        })?;
        if !released.is_empty() {
            warn!(specs = ?released, "marked leftover running specs interrupted");
        }
        Ok(())
    }

    fn final_status(&self) -> RunStatus {
        let state = self.store.state();
        let specs = self.graph.specs();
        if specs.iter().any(|s| state.spec_status(&s.id).blocks_dependents()) {
            return RunStatus::Failed;
        }
        let all_completed = specs
            .iter()
            .all(|s| state.spec_status(&s.id) == SpecStatus::Completed);
        let all_layers = self
            .graph
            .layers()
            .iter()
            .all(|l| state.layer_complete(&l.id));
        if all_completed && all_layers {
            RunStatus::Completed
        } else {
            RunStatus::Idle
        }
    }
}

/// Point the heartbeat of every lock `owner` holds among `in_flight` at `now`.
fn refresh_locks(
    state: &mut RunState,
    in_flight: &HashSet<String>,
    owner: &str,
    now: chrono::DateTime<Utc>,
) {
    for id in in_flight {
        if let Some(lock) = state.specs.get_mut(id).and_then(|s| s.lock.as_mut())
            && lock.owner == owner
        {
            lock.heartbeat = now;
        }
    }
}

/// Await `work` while refreshing in-flight locks on every heartbeat tick.
async fn keep_alive<F: Future>(
    store: &mut StateStore,
    owner: &str,
    pulse: &mut Pulse<'_>,
    work: F,
) -> F::Output {
    tokio::pin!(work);
    loop {
        tokio::select! {
            out = &mut work => return out,
            _ = pulse.ticker.tick() => {
                let in_flight = pulse.in_flight;
                let refreshed = store.update_all(|state| {
                    refresh_locks(state, in_flight, owner, Utc::now());
                    Ok(())
                });
                if let Err(e) = refreshed {
                    warn!(error = %e, "heartbeat during merge failed");
                }
            }
        }
    }
}

fn halt(failure: &mut Option<anyhow::Error>, e: anyhow::Error, task_cancel: &CancellationToken) {
    error!(error = %format!("{:#}", e), "run halted");
    task_cancel.cancel();
    if failure.is_none() {
        *failure = Some(e);
    }
}

/// Record `spec_id` as merged into `layer_id`'s staging branch, clearing a
/// pending conflict on it.
fn record_merged(state: &mut RunState, layer_id: &str, spec_id: &str) {
    if let Some(s) = state.specs.get_mut(spec_id) {
        s.merge_status = MergeStatus::Merged;
    }
    if let Some(l) = state.staging.get_mut(layer_id) {
        l.record_merge(spec_id);
        if l.pending_conflict.as_deref() == Some(spec_id) {
            l.pending_conflict = None;
        }
    }
}

/// Commit a staging merge the operator resolved and record it.
///
/// Refuses while unmerged paths or conflict markers remain. A suspended run
/// goes back to idle so the next `run` picks up where it stopped.
pub async fn continue_suspended(
    store: &mut StateStore,
    staging: &StagingManager,
) -> Result<ContinuedMerge, MergeError> {
    let Some((layer, spec)) = store
        .state()
        .pending_conflict()
        .map(|(l, s)| (l.to_string(), s.to_string()))
    else {
        return Err(MergeError::NothingToContinue);
    };
    let sha = staging.continue_merge(&layer).await?;
    store.update_all(|state| {
        record_merged(state, &layer, &spec);
        if state.run.status == RunStatus::Suspended {
            state.run.status = RunStatus::Idle;
        }
        Ok(())
    })?;
    info!(spec = %spec, layer = %layer, sha = %sha, "conflicted merge committed");
    Ok(ContinuedMerge { layer, spec, sha })
}

struct SpecTask<W: WorkflowExecutor> {
    request: SpecRequest,
    worktrees: WorktreeManager,
    executor: Arc<W>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<TaskMessage>,
    cancel: CancellationToken,
}

/// Reports a result for the spec even if the task unwinds.
struct FinishGuard {
    spec: String,
    tx: mpsc::UnboundedSender<TaskMessage>,
    started: std::time::Instant,
    result: Option<SpecResult>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let result = self.result.take().unwrap_or_else(|| {
            SpecResult::failed(
                EXECUTION_STAGE,
                "spec task aborted unexpectedly",
                self.started.elapsed(),
            )
        });
        let _ = self.tx.send(TaskMessage::Finished {
            spec: self.spec.clone(),
            result,
        });
    }
}

async fn run_spec<W: WorkflowExecutor>(task: SpecTask<W>) {
    let mut guard = FinishGuard {
        spec: task.request.spec_id.clone(),
        tx: task.tx.clone(),
        started: std::time::Instant::now(),
        result: None,
    };
    guard.result = Some(execute_spec(&task, guard.started).await);
}

async fn execute_spec<W: WorkflowExecutor>(
    task: &SpecTask<W>,
    started: std::time::Instant,
) -> SpecResult {
    let Ok(_permit) = task.semaphore.acquire().await else {
        return SpecResult::failed(EXECUTION_STAGE, "worker pool closed", started.elapsed());
    };
    if task.cancel.is_cancelled() {
        return SpecResult::interrupted(started.elapsed());
    }

    let req = &task.request;
    if let Err(e) = task
        .worktrees
        .create(&req.spec_id, &req.branch, &req.base_ref, &task.cancel)
        .await
    {
        if task.cancel.is_cancelled() {
            return SpecResult::interrupted(started.elapsed());
        }
        return SpecResult::failed(WORKTREE_SETUP_STAGE, e.to_string(), started.elapsed());
    }

    let (stage_tx, mut stage_rx) = mpsc::unbounded_channel::<String>();
    let forward_tx = task.tx.clone();
    let spec = req.spec_id.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(stage) = stage_rx.recv().await {
            let _ = forward_tx.send(TaskMessage::Stage {
                spec: spec.clone(),
                stage,
            });
        }
    });

    let result = task.executor.execute(req, stage_tx, &task.cancel).await;
    // Stage messages must land before the outcome.
    let _ = forwarder.await;
    result
}
