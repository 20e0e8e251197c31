//! Ready-set computation and state normalisation.
//!
//! Everything here is a pure function of the validated graph and the run
//! state, so resuming from a persisted document yields exactly the ready set
//! the interrupted run would have computed.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

use crate::conflict::ConflictMode;
use crate::definition::SpecGraph;
use crate::errors::StateError;
use crate::staging::MergeCadence;
use crate::state::{RunState, SpecStatus};

/// Configuration for one `run`.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum specs executing at once.
    pub max_parallel: usize,
    /// Stop dispatching after the first failure.
    pub fail_fast: bool,
    /// Restrict dispatch to these spec ids.
    pub only: Option<HashSet<String>>,
    /// Specs to reset to pending before the run, poison included.
    pub retry: Vec<String>,
    pub poison_threshold: u32,
    pub heartbeat_interval: Duration,
    pub stale_grace: Duration,
    pub cancel_grace: Duration,
    pub merge_cadence: MergeCadence,
    pub conflict_mode: ConflictMode,
    pub default_timeout_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            fail_fast: false,
            only: None,
            retry: Vec::new(),
            poison_threshold: 3,
            heartbeat_interval: Duration::from_secs(15),
            stale_grace: Duration::from_secs(120),
            cancel_grace: Duration::from_secs(10),
            merge_cadence: MergeCadence::Immediate,
            conflict_mode: ConflictMode::Manual,
            default_timeout_minutes: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_only(mut self, only: Option<HashSet<String>>) -> Self {
        self.only = only;
        self
    }

    pub fn with_retry(mut self, retry: Vec<String>) -> Self {
        self.retry = retry;
        self
    }

    fn stale_grace_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_grace).unwrap_or(chrono::Duration::MAX)
    }
}

/// What start-of-run normalisation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalization {
    /// Failed, blocked or retried specs returned to pending.
    pub reset: Vec<String>,
    /// Running specs whose owner is gone.
    pub interrupted: Vec<String>,
}

/// Prepare persisted state for a new `run` of the same document.
///
/// - `failed` (not poison) and `blocked` specs go back to `pending`;
/// - ids in `config.retry` are reset whatever their state, poison included;
/// - `running` specs with a stale or missing lock become `interrupted`;
/// - a `running` spec with a live lock held by another owner refuses the run.
pub fn normalize_for_run(
    graph: &SpecGraph,
    state: &mut RunState,
    owner: &str,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> Result<Normalization, StateError> {
    for id in &config.retry {
        if graph.spec(id).is_none() {
            return Err(StateError::UnknownSpec(id.clone()));
        }
    }

    let grace = config.stale_grace_chrono();
    // Refuse before changing anything.
    for spec in graph.specs() {
        if let Some(s) = state.specs.get(&spec.id)
            && s.status == SpecStatus::Running
            && let Some(lock) = &s.lock
            && lock.owner != owner
            && !lock.is_stale(now, grace)
        {
            return Err(StateError::LiveLock {
                spec: spec.id.clone(),
                owner: lock.owner.clone(),
            });
        }
    }

    let mut out = Normalization::default();
    for spec in graph.specs() {
        let Some(s) = state.specs.get_mut(&spec.id) else {
            continue;
        };
        if config.retry.iter().any(|r| r == &spec.id) && s.status != SpecStatus::Completed {
            s.reset_for_retry();
            out.reset.push(spec.id.clone());
            continue;
        }
        match s.status {
            SpecStatus::Failed | SpecStatus::Blocked => {
                s.transition(&spec.id, SpecStatus::Pending)?;
                s.failure_reason = None;
                out.reset.push(spec.id.clone());
            }
            SpecStatus::Running => {
                s.transition(&spec.id, SpecStatus::Interrupted)?;
                s.lock = None;
                out.interrupted.push(spec.id.clone());
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Convert `running` specs whose heartbeat went stale to `interrupted`.
/// Specs in `in_flight` belong to this process and are skipped.
pub fn reap_stale(
    state: &mut RunState,
    in_flight: &HashSet<String>,
    now: DateTime<Utc>,
    grace: Duration,
) -> Vec<String> {
    let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
    let mut reaped = Vec::new();
    for (id, s) in state.specs.iter_mut() {
        if s.status != SpecStatus::Running || in_flight.contains(id) {
            continue;
        }
        let stale = s.lock.as_ref().is_none_or(|l| l.is_stale(now, grace));
        if stale {
            s.status = SpecStatus::Interrupted;
            s.lock = None;
            reaped.push(id.clone());
        }
    }
    reaped
}

/// Mark dispatchable specs with a failed, poisoned or blocked effective
/// dependency as `blocked`, transitively. Returns the newly blocked ids.
pub fn propagate_blocked(graph: &SpecGraph, state: &mut RunState) -> Vec<String> {
    let mut blocked = Vec::new();
    loop {
        let mut changed = false;
        for spec in graph.specs() {
            if !state.spec_status(&spec.id).is_dispatchable() {
                continue;
            }
            let dep_blocks = graph
                .effective_dependencies(&spec.id)
                .iter()
                .any(|d| state.spec_status(d).blocks_dependents());
            if dep_blocks && let Some(s) = state.specs.get_mut(&spec.id) {
                s.status = SpecStatus::Blocked;
                blocked.push(spec.id.clone());
                changed = true;
            }
        }
        if !changed {
            return blocked;
        }
    }
}

/// Whether a layer's specs may materialize: the first layer always, later
/// layers once the previous layer's staging branch is complete.
pub fn layer_open(graph: &SpecGraph, state: &RunState, layer_index: usize) -> bool {
    match graph.previous_layer(layer_index) {
        Some(prev) => state.layer_complete(&prev.id),
        None => true,
    }
}

/// Specs that can be dispatched now, in declaration order.
pub fn ready_set(graph: &SpecGraph, state: &RunState, only: Option<&HashSet<String>>) -> Vec<String> {
    graph
        .specs()
        .iter()
        .filter(|spec| state.spec_status(&spec.id).is_dispatchable())
        .filter(|spec| only.is_none_or(|o| o.contains(&spec.id)))
        .filter(|spec| layer_open(graph, state, spec.layer_index))
        .filter(|spec| {
            graph
                .effective_dependencies(&spec.id)
                .iter()
                .all(|d| state.spec_status(d) == SpecStatus::Completed)
        })
        .map(|spec| spec.id.clone())
        .collect()
}

/// Every spec of the layer has reached a terminal state.
pub fn layer_settled(graph: &SpecGraph, state: &RunState, layer_id: &str) -> bool {
    graph
        .specs_in_layer(layer_id)
        .iter()
        .all(|s| state.spec_status(s).is_terminal())
}
