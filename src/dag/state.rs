//! Run outcome reporting.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::conflict::ConflictContext;
use crate::definition::SpecGraph;
use crate::exit_codes;
use crate::state::{RunState, RunStatus, SpecStatus};

/// A spec that ended failed or poisoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub spec: String,
    pub status: SpecStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Spec counts by status at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub poison: usize,
    pub blocked: usize,
    pub interrupted: usize,
    pub pending: usize,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl RunSummary {
    pub fn from_state(graph: &SpecGraph, state: &RunState) -> Self {
        let mut summary = Self {
            total: graph.len(),
            ..Default::default()
        };
        for spec in graph.specs() {
            match state.spec_status(&spec.id) {
                SpecStatus::Completed => summary.completed += 1,
                SpecStatus::Failed => summary.failed += 1,
                SpecStatus::Poison => summary.poison += 1,
                SpecStatus::Blocked => summary.blocked += 1,
                SpecStatus::Interrupted => summary.interrupted += 1,
                SpecStatus::Pending | SpecStatus::Running => summary.pending += 1,
            }
        }
        summary
    }

    pub fn all_success(&self) -> bool {
        self.completed == self.total
    }

    pub fn any_failed(&self) -> bool {
        self.failed + self.poison + self.blocked > 0
    }
}

/// Result of `Orchestrator::run`.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub summary: RunSummary,
    pub failures: Vec<FailureSummary>,
    /// Set when the run suspended on a merge conflict.
    pub conflict: Option<ConflictContext>,
}

impl RunReport {
    pub fn failures_from_state(graph: &SpecGraph, state: &RunState) -> Vec<FailureSummary> {
        graph
            .specs()
            .iter()
            .filter_map(|spec| {
                let s = state.specs.get(&spec.id)?;
                matches!(s.status, SpecStatus::Failed | SpecStatus::Poison).then(|| {
                    FailureSummary {
                        spec: spec.id.clone(),
                        status: s.status,
                        stage: s.failed_stage.clone(),
                        reason: s.failure_reason.clone(),
                    }
                })
            })
            .collect()
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Suspended => exit_codes::SUSPENDED,
            RunStatus::Failed | RunStatus::Cancelled => exit_codes::FAILED,
            _ if self.summary.any_failed() => exit_codes::FAILED,
            _ => exit_codes::OK,
        }
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Definition, ValidateOptions, validate};
    use crate::state::SpecState;

    fn graph() -> SpecGraph {
        let def = Definition::parse(
            "layers:\n  - id: L0\n    specs:\n      - id: a\n        description: a\n      - id: b\n        description: b\n",
        )
        .unwrap();
        validate(&def, &ValidateOptions::default()).unwrap().graph
    }

    fn with(statuses: &[(&str, SpecStatus)]) -> RunState {
        let mut state = RunState::default();
        for (id, status) in statuses {
            state.specs.insert(
                id.to_string(),
                SpecState {
                    status: *status,
                    failed_stage: Some("test".into()),
                    failure_reason: Some("boom".into()),
                    ..Default::default()
                },
            );
        }
        state
    }

    #[test]
    fn test_summary_counts() {
        let g = graph();
        let s = with(&[("a", SpecStatus::Completed), ("b", SpecStatus::Poison)]);
        let summary = RunSummary::from_state(&g, &s);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.poison, 1);
        assert!(!summary.all_success());
        assert!(summary.any_failed());
    }

    #[test]
    fn test_failures_and_exit_codes() {
        let g = graph();
        let s = with(&[("a", SpecStatus::Completed), ("b", SpecStatus::Failed)]);
        let failures = RunReport::failures_from_state(&g, &s);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].spec, "b");
        assert_eq!(failures[0].stage.as_deref(), Some("test"));

        let mut report = RunReport {
            status: RunStatus::Failed,
            summary: RunSummary::from_state(&g, &s),
            failures,
            conflict: None,
        };
        assert_eq!(report.exit_code(), exit_codes::FAILED);
        report.status = RunStatus::Suspended;
        assert_eq!(report.exit_code(), exit_codes::SUSPENDED);

        let ok = with(&[("a", SpecStatus::Completed), ("b", SpecStatus::Completed)]);
        report.status = RunStatus::Completed;
        report.summary = RunSummary::from_state(&g, &ok);
        assert_eq!(report.exit_code(), exit_codes::OK);
    }
}
