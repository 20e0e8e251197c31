//! [`WorkflowExecutor`] backed by an external coding agent.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::agent::{Agent, Invocation, InvocationEnd};
use super::commit::{COMMIT_VERIFICATION_STAGE, CommitVerifier};
use super::{EXECUTION_STAGE, SpecOutcome, SpecRequest, SpecResult, WorkflowExecutor};
use crate::errors::ExecutionError;

/// Lines of agent output quoted in a failure reason.
const REASON_TAIL_LINES: usize = 10;

pub struct AgentWorkflow {
    agent: Arc<dyn Agent>,
    verifier: CommitVerifier,
}

impl AgentWorkflow {
    pub fn new(agent: Arc<dyn Agent>, verifier: CommitVerifier) -> Self {
        Self { agent, verifier }
    }
}

/// Prompt handed to the agent for one spec.
pub fn build_prompt(request: &SpecRequest) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Spec: {}\n\n", request.spec_id));
    prompt.push_str(&format!("{}\n\n", request.description.trim()));

    if request.content_dir.is_dir() {
        prompt.push_str(&format!(
            "The spec's documents are in `{}`. Read them before starting and keep \
             them up to date as you work.\n\n",
            request.content_dir.display()
        ));
    } else {
        prompt.push_str(&format!(
            "No spec documents exist yet. Start by writing them to `{}` from the \
             description above, then implement them.\n\n",
            request.content_dir.display()
        ));
    }

    prompt.push_str(&format!(
        "You are working in `{}` on branch `{}`, created from `{}`. Only change files \
         inside this directory.\n\n",
        request.workdir.display(),
        request.branch,
        request.base_ref
    ));
    prompt.push_str(
        "Whenever you move to a new stage of the work (for example plan, implement, \
         test, review), print a line of the form `<stage>NAME</stage>`.\n\n",
    );
    prompt.push_str(
        "When you are done, commit all of your changes to the current branch with \
         `git add -A && git commit`. Uncommitted work is treated as a failure.\n",
    );
    prompt
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[async_trait]
impl WorkflowExecutor for AgentWorkflow {
    async fn execute(
        &self,
        request: &SpecRequest,
        stages: UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> SpecResult {
        let start = Instant::now();
        let invocation = Invocation {
            workdir: request.workdir.clone(),
            prompt: build_prompt(request),
            timeout: request.timeout,
            log_file: Some(request.log_file.clone()),
            stage_tx: Some(stages),
        };

        info!(spec = %request.spec_id, agent = %self.agent.name(), "invoking agent");
        let output = match self.agent.invoke(&invocation, cancel).await {
            Ok(o) => o,
            Err(e) => {
                warn!(spec = %request.spec_id, error = %e, "agent invocation failed");
                return SpecResult::failed(EXECUTION_STAGE, e.to_string(), start.elapsed());
            }
        };

        let stage = output
            .last_stage
            .clone()
            .unwrap_or_else(|| EXECUTION_STAGE.to_string());
        let mut result = SpecResult {
            outcome: SpecOutcome::Completed,
            exit_code: output.exit_code,
            duration: output.duration,
            last_stage: output.last_stage.clone(),
            commit_status: Default::default(),
            commit_sha: None,
        };

        match output.end {
            InvocationEnd::Cancelled => {
                result.outcome = SpecOutcome::Interrupted;
                return result;
            }
            InvocationEnd::TimedOut => {
                let reason = ExecutionError::TimedOut {
                    limit: request.timeout,
                }
                .to_string();
                result.outcome = SpecOutcome::Failed { stage, reason };
                return result;
            }
            InvocationEnd::Exited if !output.success() => {
                let code = output.exit_code.unwrap_or(-1);
                let mut reason = ExecutionError::NonZeroExit { exit_code: code }.to_string();
                let tail = tail_lines(&output.tail, REASON_TAIL_LINES);
                if !tail.trim().is_empty() {
                    reason.push_str(":\n");
                    reason.push_str(&tail);
                }
                result.outcome = SpecOutcome::Failed { stage, reason };
                return result;
            }
            InvocationEnd::Exited => {}
        }

        let report = match self
            .verifier
            .verify(
                &request.spec_id,
                &request.workdir,
                &request.base_ref,
                self.agent.as_ref(),
                cancel,
            )
            .await
        {
            Ok(r) => r,
            Err(ExecutionError::Cancelled) => {
                result.outcome = SpecOutcome::Interrupted;
                return result;
            }
            Err(e) => {
                result.outcome = SpecOutcome::Failed {
                    stage: COMMIT_VERIFICATION_STAGE.to_string(),
                    reason: e.to_string(),
                };
                return result;
            }
        };

        result.commit_status = report.status;
        result.commit_sha = report.sha.clone();
        result.duration = start.elapsed();
        if !report.is_ok() {
            let reason = ExecutionError::CommitVerification {
                attempts: report.retries_used + 1,
                reason: report.reason(&request.base_ref),
            }
            .to_string();
            result.outcome = SpecOutcome::Failed {
                stage: COMMIT_VERIFICATION_STAGE.to_string(),
                reason,
            };
        }
        result
    }
}
