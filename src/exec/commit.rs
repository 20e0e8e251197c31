//! Post-execution commit verification.
//!
//! An agent that exits 0 but leaves its work uncommitted (or made no commits
//! at all) has not finished. The verifier checks the worktree against the
//! spec's base reference and, when configured, retries a commit action.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::agent::{Agent, Invocation, InvocationEnd};
use crate::config::CommitSection;
use crate::errors::ExecutionError;
use crate::git::{self, cli};
use crate::state::CommitStatus;

/// Stage name recorded when verification is exhausted.
pub const COMMIT_VERIFICATION_STAGE: &str = "commit-verification";

/// How a missing commit is remedied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitAction {
    /// `git add -A && git commit` on the agent's behalf.
    #[default]
    Auto,
    /// Re-invoke the agent with a commit instruction.
    Agent,
}

impl std::fmt::Display for CommitAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitAction::Auto => write!(f, "auto"),
            CommitAction::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for CommitAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(CommitAction::Auto),
            "agent" => Ok(CommitAction::Agent),
            _ => anyhow::bail!("Invalid commit action '{}'. Valid values: auto, agent", s),
        }
    }
}

/// Outcome of verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub status: CommitStatus,
    pub sha: Option<String>,
    /// Commit actions performed.
    pub retries_used: u32,
}

impl CommitReport {
    pub fn is_ok(&self) -> bool {
        matches!(self.status, CommitStatus::Verified | CommitStatus::Unchecked)
    }

    /// Failure reason for a report that is not ok.
    pub fn reason(&self, base_ref: &str) -> String {
        match self.status {
            CommitStatus::Uncommitted => "work left uncommitted in the worktree".to_string(),
            CommitStatus::Missing => format!("no commits ahead of {}", base_ref),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommitVerifier {
    verify: bool,
    retries: u32,
    action: CommitAction,
    /// Time allowed for one agent commit action.
    agent_timeout: Duration,
    /// Local-only paths (copied directories) never counted or committed.
    excluded: Vec<String>,
}

impl CommitVerifier {
    pub fn new(verify: bool, retries: u32, action: CommitAction) -> Self {
        Self {
            verify,
            retries,
            action,
            agent_timeout: Duration::from_secs(600),
            excluded: Vec::new(),
        }
    }

    /// Ignore `paths` when checking for and committing leftover work.
    pub fn with_excluded(mut self, paths: Vec<String>) -> Self {
        self.excluded = paths;
        self
    }

    pub fn from_config(section: &CommitSection) -> Self {
        Self::new(section.verify, section.retries, section.action)
    }

    /// Inspect `workdir` relative to `base_ref`, ignoring `excluded` paths.
    pub fn check(
        workdir: &Path,
        base_ref: &str,
        excluded: &[String],
    ) -> Result<CommitStatus, ExecutionError> {
        if git::has_uncommitted_changes(workdir, excluded)? {
            return Ok(CommitStatus::Uncommitted);
        }
        if git::head_commits_ahead(workdir, base_ref)? == 0 {
            return Ok(CommitStatus::Missing);
        }
        Ok(CommitStatus::Verified)
    }

    /// Verify the spec produced a commit, running the commit action up to
    /// `retries` times.
    pub async fn verify(
        &self,
        spec_id: &str,
        workdir: &Path,
        base_ref: &str,
        agent: &dyn Agent,
        cancel: &CancellationToken,
    ) -> Result<CommitReport, ExecutionError> {
        if !self.verify {
            return Ok(CommitReport {
                status: CommitStatus::Unchecked,
                sha: git::head_sha(workdir)?,
                retries_used: 0,
            });
        }

        let mut retries_used = 0;
        loop {
            let status = Self::check(workdir, base_ref, &self.excluded)?;
            debug!(spec = spec_id, ?status, attempt = retries_used, "commit check");
            if status == CommitStatus::Verified || retries_used >= self.retries {
                if status != CommitStatus::Verified {
                    warn!(spec = spec_id, ?status, "commit verification exhausted");
                }
                return Ok(CommitReport {
                    status,
                    sha: git::head_sha(workdir)?,
                    retries_used,
                });
            }
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            retries_used += 1;
            info!(spec = spec_id, action = %self.action, attempt = retries_used, "retrying commit");
            match self.action {
                CommitAction::Auto => {
                    let message = format!("orchard: {}", spec_id);
                    if !cli::commit_all(workdir, &message, &self.excluded).await? {
                        debug!(spec = spec_id, "nothing to commit");
                    }
                }
                CommitAction::Agent => {
                    let invocation = Invocation {
                        workdir: workdir.to_path_buf(),
                        prompt: commit_prompt(spec_id, base_ref),
                        timeout: self.agent_timeout,
                        log_file: None,
                        stage_tx: None,
                    };
                    let out = agent.invoke(&invocation, cancel).await?;
                    if out.end == InvocationEnd::Cancelled {
                        return Err(ExecutionError::Cancelled);
                    }
                }
            }
        }
    }
}

fn commit_prompt(spec_id: &str, base_ref: &str) -> String {
    format!(
        "Your work on spec '{spec_id}' is not committed. Stage every change that belongs \
         to the spec and create at least one git commit on the current branch so that it \
         is ahead of {base_ref}. Do not make any other changes."
    )
}
