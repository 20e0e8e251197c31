//! Execution adapter: runs one spec's workflow inside its worktree.
//!
//! The scheduler only sees [`WorkflowExecutor`]. The production
//! implementation, [`AgentWorkflow`], drives a coding-agent CLI described by
//! an [`AgentProfile`] and verifies that the agent's work was committed.

pub mod agent;
pub mod commit;
pub mod workflow;

pub use agent::{
    Agent, AgentKind, AgentProfile, Invocation, InvocationEnd, InvocationOutput, ProcessAgent,
    PromptDelivery, parse_stage_marker,
};
pub use commit::{COMMIT_VERIFICATION_STAGE, CommitAction, CommitReport, CommitVerifier};
pub use workflow::AgentWorkflow;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::state::CommitStatus;

/// Stage recorded for failures before the agent reported any stage.
pub const EXECUTION_STAGE: &str = "execution";

/// Everything a workflow needs to run one spec.
#[derive(Debug, Clone)]
pub struct SpecRequest {
    pub spec_id: String,
    pub description: String,
    /// `<spec_root>/<id>`; may not exist yet.
    pub content_dir: PathBuf,
    pub workdir: PathBuf,
    pub branch: String,
    /// Reference the spec branch was created from.
    pub base_ref: String,
    pub timeout: Duration,
    pub log_file: PathBuf,
}

/// Terminal outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecOutcome {
    Completed,
    Failed { stage: String, reason: String },
    /// Cancelled before finishing; eligible for dispatch again.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct SpecResult {
    pub outcome: SpecOutcome,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub last_stage: Option<String>,
    pub commit_status: CommitStatus,
    pub commit_sha: Option<String>,
}

impl SpecResult {
    pub fn failed(stage: &str, reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            outcome: SpecOutcome::Failed {
                stage: stage.to_string(),
                reason: reason.into(),
            },
            exit_code: None,
            duration,
            last_stage: None,
            commit_status: CommitStatus::Unchecked,
            commit_sha: None,
        }
    }

    pub fn interrupted(duration: Duration) -> Self {
        Self {
            outcome: SpecOutcome::Interrupted,
            exit_code: None,
            duration,
            last_stage: None,
            commit_status: CommitStatus::Unchecked,
            commit_sha: None,
        }
    }
}

/// Runs one spec's multi-stage workflow to a terminal outcome.
///
/// Implementations report stage changes on `stages` and must honour
/// `cancel`, returning [`SpecOutcome::Interrupted`] when it trips.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        request: &SpecRequest,
        stages: UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> SpecResult;
}
