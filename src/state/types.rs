//! Run-state records persisted after the definition text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::errors::StateError;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    /// Waiting on a manual conflict resolution.
    Suspended,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// The owning process went away or the run was cancelled mid-flight.
    Interrupted,
    /// A dependency failed, was poisoned or is itself blocked.
    Blocked,
    /// Repeated failures at the same stage; only a forced retry reschedules it.
    Poison,
}

impl SpecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
            Self::Blocked => "blocked",
            Self::Poison => "poison",
        }
    }

    /// Terminal for the purposes of layer completion.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Poison | Self::Blocked
        )
    }

    /// States that make dependents unrunnable.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Poison | Self::Blocked)
    }

    /// Whether the scheduler may dispatch a spec in this state.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Pending | Self::Interrupted)
    }

    /// Legal transitions outside of an explicit fresh/clean reset.
    pub fn can_transition(&self, to: SpecStatus) -> bool {
        use SpecStatus::*;
        match (self, to) {
            (a, b) if *a == b => true,
            (Pending, Running | Blocked) => true,
            (Running, Completed | Failed | Interrupted | Poison) => true,
            (Interrupted, Pending | Running | Poison | Blocked) => true,
            (Failed, Pending | Poison) => true,
            (Blocked, Pending) => true,
            (Poison, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SpecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the spec's work was actually committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    #[default]
    Unchecked,
    Verified,
    /// No commits ahead of the base reference.
    Missing,
    /// Work left uncommitted in the worktree.
    Uncommitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Unmerged,
    Merged,
    Conflicted,
}

/// Exclusive-ownership record refreshed by the running orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner: String,
    pub heartbeat: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(owner: &str, now: DateTime<Utc>) -> Self {
        Self {
            owner: owner.to_string(),
            heartbeat: now,
        }
    }

    /// A lock is stale once its heartbeat is older than `grace`.
    pub fn is_stale(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        now.signed_duration_since(self.heartbeat) > grace
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpecState {
    #[serde(default)]
    pub status: SpecStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Last stage reported by the workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub commit_status: CommitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Stage at which the most recent failure happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(default)]
    pub merge_status: MergeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockRecord>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl SpecState {
    /// Move to `to`, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, spec: &str, to: SpecStatus) -> Result<(), StateError> {
        if !self.status.can_transition(to) {
            return Err(StateError::InvalidTransition {
                spec: spec.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Record a failure at `stage`. Consecutive failures at the same stage
    /// accumulate; reaching `poison_threshold` poisons the spec. Returns the
    /// resulting status.
    pub fn record_failure(
        &mut self,
        spec: &str,
        stage: &str,
        reason: &str,
        poison_threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<SpecStatus, StateError> {
        if self.failed_stage.as_deref() == Some(stage) {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 1;
        }
        self.failed_stage = Some(stage.to_string());
        self.failure_reason = Some(reason.to_string());
        self.finished_at = Some(now);
        self.lock = None;

        let target = if poison_threshold > 0 && self.consecutive_failures >= poison_threshold {
            SpecStatus::Poison
        } else {
            SpecStatus::Failed
        };
        self.transition(spec, target)?;
        Ok(target)
    }

    /// Reset for a forced retry: back to pending with failure counters cleared.
    pub fn reset_for_retry(&mut self) {
        self.status = SpecStatus::Pending;
        self.consecutive_failures = 0;
        self.failed_stage = None;
        self.failure_reason = None;
        self.lock = None;
    }
}

/// Per-layer integration branch bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StagingState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Reference the staging branch was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    /// Spec ids already merged, in merge order.
    #[serde(default)]
    pub merged: Vec<String>,
    #[serde(default)]
    pub complete: bool,
    /// Spec whose merge is suspended on a conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_conflict: Option<String>,
}

impl StagingState {
    pub fn is_merged(&self, spec: &str) -> bool {
        self.merged.iter().any(|s| s == spec)
    }

    pub fn record_merge(&mut self, spec: &str) {
        if !self.is_merged(spec) {
            self.merged.push(spec.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// The whole runtime-state section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub run: RunInfo,
    #[serde(default)]
    pub specs: BTreeMap<String, SpecState>,
    #[serde(default)]
    pub staging: BTreeMap<String, StagingState>,
}

impl RunState {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn spec_status(&self, id: &str) -> SpecStatus {
        self.specs.get(id).map(|s| s.status).unwrap_or_default()
    }

    pub fn layer_complete(&self, layer: &str) -> bool {
        self.staging.get(layer).is_some_and(|s| s.complete)
    }

    /// The first layer with a merge suspended on a conflict.
    pub fn pending_conflict(&self) -> Option<(&str, &str)> {
        self.staging.iter().find_map(|(layer, s)| {
            s.pending_conflict
                .as_deref()
                .map(|spec| (layer.as_str(), spec))
        })
    }

    /// Count of specs by status, in lifecycle order.
    pub fn counts(&self) -> Vec<(SpecStatus, usize)> {
        use SpecStatus::*;
        [Pending, Running, Completed, Failed, Interrupted, Blocked, Poison]
            .into_iter()
            .map(|st| (st, self.specs.values().filter(|s| s.status == st).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_status_transitions() {
        use SpecStatus::*;
        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Completed));
        assert!(Interrupted.can_transition(Running));
        assert!(Failed.can_transition(Pending));
        assert!(!Completed.can_transition(Running));
        assert!(!Completed.can_transition(Pending));
        assert!(!Pending.can_transition(Completed));
        assert!(!Poison.can_transition(Running));
    }

    #[test]
    fn test_transition_rejects_completed_overwrite() {
        let mut state = SpecState {
            status: SpecStatus::Completed,
            ..Default::default()
        };
        let err = state.transition("api", SpecStatus::Running).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert_eq!(state.status, SpecStatus::Completed);
    }

    #[test]
    fn test_record_failure_poisons_after_threshold_at_same_stage() {
        let now = Utc::now();
        let mut state = SpecState::default();
        for attempt in 1..=3 {
            state.status = SpecStatus::Running;
            let status = state.record_failure("api", "build", "exit 1", 3, now).unwrap();
            if attempt < 3 {
                assert_eq!(status, SpecStatus::Failed);
            } else {
                assert_eq!(status, SpecStatus::Poison);
            }
        }
        assert_eq!(state.consecutive_failures, 3);
    }

    #[test]
    fn test_record_failure_resets_count_on_new_stage() {
        let now = Utc::now();
        let mut state = SpecState {
            status: SpecStatus::Running,
            ..Default::default()
        };
        state.record_failure("api", "build", "x", 3, now).unwrap();
        state.status = SpecStatus::Running;
        state.record_failure("api", "build", "x", 3, now).unwrap();
        state.status = SpecStatus::Running;
        let status = state.record_failure("api", "test", "x", 3, now).unwrap();
        assert_eq!(status, SpecStatus::Failed);
        assert_eq!(state.consecutive_failures, 1);
    }

    #[test]
    fn test_lock_staleness() {
        let now = Utc::now();
        let lock = LockRecord::new("me", now - chrono::Duration::seconds(200));
        assert!(lock.is_stale(now, chrono::Duration::seconds(120)));
        assert!(!lock.is_stale(now, chrono::Duration::seconds(300)));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let yaml = serde_yaml::to_string(&SpecStatus::Interrupted).unwrap();
        assert_eq!(yaml.trim(), "interrupted");
        let parsed: CommitStatus = serde_yaml::from_str("uncommitted").unwrap();
        assert_eq!(parsed, CommitStatus::Uncommitted);
    }

    #[test]
    fn test_pending_conflict_lookup() {
        let mut state = RunState::default();
        state.staging.insert(
            "L0".into(),
            StagingState {
                pending_conflict: Some("api".into()),
                ..Default::default()
            },
        );
        assert_eq!(state.pending_conflict(), Some(("L0", "api")));
    }
}
