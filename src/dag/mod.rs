//! Layered spec scheduling.
//!
//! Specs run in parallel, bounded by `max_parallel`, while respecting both
//! their `depends_on` edges and layer gates: a layer's specs only start once
//! the previous layer's staging branch is complete.
//!
//! ## Architecture
//!
//! 1. **Scheduler** - pure functions over the graph and run state: start-of-run
//!    normalisation, ready set, block propagation, stale-lock reaping
//! 2. **Executor** - the [`Orchestrator`] loop that owns the state document,
//!    dispatches spec tasks and merges their results into staging
//! 3. **State** - the [`RunReport`] a run ends with
//!
//! ## Example
//!
//! ```no_run
//! use orchard::dag::{SchedulerConfig, ready_set};
//! use orchard::definition::{Definition, ValidateOptions, validate};
//! use orchard::state::RunState;
//!
//! # fn example() -> anyhow::Result<()> {
//! let def = Definition::parse(
//!     "layers:\n  - id: L0\n    specs:\n      - id: api\n        description: API\n",
//! )?;
//! let graph = validate(&def, &ValidateOptions::default())?.graph;
//! let ready = ready_set(&graph, &RunState::default(), None);
//! assert_eq!(ready, vec!["api"]);
//! # let _ = SchedulerConfig::default();
//! # Ok(())
//! # }
//! ```

mod executor;
mod scheduler;
mod state;

pub use executor::{
    ContinuedMerge, Orchestrator, RunEvent, RunPaths, WORKTREE_SETUP_STAGE, continue_suspended,
};
pub use scheduler::{
    Normalization, SchedulerConfig, layer_open, layer_settled, normalize_for_run,
    propagate_blocked, reap_stale, ready_set,
};
pub use state::{ExecutionTimer, FailureSummary, RunReport, RunSummary};
