//! Typed error hierarchy for the orchard orchestrator.
//!
//! One enum per subsystem:
//! - `DefinitionError`: malformed, cyclic or dangling definitions (fatal before execution)
//! - `StateError`: run-state document access and illegal status transitions
//! - `WorktreeError`: worktree creation, setup, validation and removal
//! - `ExecutionError`: per-spec workflow invocation
//! - `MergeError`: staging and final merges

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::definition::Diagnostic;

/// Errors raised while reading or validating a definition document.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Failed to read definition at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", syntax_message(.line, .column, .message))]
    Syntax {
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },

    #[error("Invalid definition:\n{}", render_diagnostics(.0))]
    Invalid(Vec<Diagnostic>),
}

impl DefinitionError {
    /// Diagnostics carried by this error, including a synthetic one for syntax errors.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            Self::Read { .. } => vec![Diagnostic::new(None, self.to_string())],
            Self::Syntax { line, message, .. } => vec![Diagnostic::new(*line, message.clone())],
            Self::Invalid(diags) => diags.clone(),
        }
    }
}

fn syntax_message(line: &Option<usize>, column: &Option<usize>, message: &str) -> String {
    match (line, column) {
        (Some(l), Some(c)) => format!("Definition syntax error at line {}, column {}: {}", l, c, message),
        (Some(l), None) => format!("Definition syntax error at line {}: {}", l, message),
        _ => format!("Definition syntax error: {}", message),
    }
}

fn preserved_suffix(preserved: &bool) -> &'static str {
    if *preserved {
        " (worktree preserved for debugging)"
    } else {
        ""
    }
}

fn render_diagnostics(diags: &[Diagnostic]) -> String {
    diags
        .iter()
        .map(|d| format!("  {}", d))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors from the run-state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to access state document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run state section of {path} is unreadable: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Another orchard process holds the state lock for {path}")]
    Busy { path: PathBuf },

    #[error("Unknown spec '{0}' in run state")]
    UnknownSpec(String),

    #[error("Unknown layer '{0}' in run state")]
    UnknownLayer(String),

    #[error("Spec '{spec}' is running under another live orchard process (owner {owner})")]
    LiveLock { spec: String, owner: String },

    #[error("Illegal transition for spec '{spec}': {from} -> {to}")]
    InvalidTransition {
        spec: String,
        from: String,
        to: String,
    },
}

/// Errors from the worktree lifecycle manager.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Worktree for spec '{spec}' already exists at {path}")]
    AlreadyExists { spec: String, path: PathBuf },

    #[error("Worktree creation for spec '{0}' is already in progress")]
    CreationInProgress(String),

    #[error("Base reference '{0}' does not exist")]
    MissingBaseRef(String),

    #[error("Setup for spec '{spec}' failed: {reason}{}", preserved_suffix(.preserved))]
    SetupFailed {
        spec: String,
        reason: String,
        preserved: bool,
    },

    #[error("Worktree validation for spec '{spec}' failed: {reason}{}", preserved_suffix(.preserved))]
    ValidationFailed {
        spec: String,
        reason: String,
        preserved: bool,
    },

    #[error("Refusing to remove worktree {path}: {reason} (use --force to override)")]
    Dirty { path: PathBuf, reason: String },

    #[error("No worktree registered for spec '{0}'")]
    NotFound(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single spec execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to spawn agent '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent exited with non-zero code {exit_code}")]
    NonZeroExit { exit_code: i32 },

    #[error("Agent timed out after {}", describe_limit(.limit))]
    TimedOut { limit: Duration },

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("Commit verification failed after {attempts} attempt(s): {reason}")]
    CommitVerification { attempts: u32, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the staging and merge manager.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Layer '{0}' is not complete yet")]
    LayerIncomplete(String),

    #[error("Specs did not complete: {}; rerun or pass --skip-failed", .0.join(", "))]
    FailedSpecs(Vec<String>),

    #[error("A merge conflict is pending for spec '{spec}' in {workdir}; resolve it and run `merge --continue`")]
    ConflictPending { spec: String, workdir: PathBuf },

    #[error("No merge is waiting to be continued")]
    NothingToContinue,

    #[error("Unresolved conflicts remain in: {}", .0.join(", "))]
    Unresolved(Vec<String>),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Human-readable time limit: whole minutes when exact, otherwise seconds
/// (milliseconds below one second).
fn describe_limit(limit: &Duration) -> String {
    let secs = limit.as_secs();
    if secs == 0 {
        format!("{} ms", limit.as_millis())
    } else if secs % 60 != 0 {
        format!("{} seconds", secs)
    } else {
        format!("{} minutes", secs / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_error_invalid_lists_every_diagnostic() {
        let err = DefinitionError::Invalid(vec![
            Diagnostic::new(Some(4), "duplicate spec id 'api'"),
            Diagnostic::new(None, "cycle detected: a -> b -> a"),
        ]);
        let text = err.to_string();
        assert!(text.contains("line 4: duplicate spec id 'api'"));
        assert!(text.contains("cycle detected: a -> b -> a"));
        assert_eq!(err.diagnostics().len(), 2);
    }

    #[test]
    fn definition_error_syntax_carries_position() {
        let err = DefinitionError::Syntax {
            line: Some(3),
            column: Some(7),
            message: "mapping values are not allowed".into(),
        };
        assert!(err.to_string().contains("line 3, column 7"));
        assert_eq!(err.diagnostics()[0].line, Some(3));
    }

    #[test]
    fn worktree_setup_failed_mentions_preservation() {
        let kept = WorktreeError::SetupFailed {
            spec: "api".into(),
            reason: "exit 1".into(),
            preserved: true,
        };
        assert!(kept.to_string().contains("preserved"));

        let rolled_back = WorktreeError::SetupFailed {
            spec: "api".into(),
            reason: "exit 1".into(),
            preserved: false,
        };
        assert!(!rolled_back.to_string().contains("preserved"));
    }

    #[test]
    fn execution_timeout_reads_in_natural_units() {
        let text = |limit| ExecutionError::TimedOut { limit }.to_string();
        assert_eq!(text(Duration::from_secs(1800)), "Agent timed out after 30 minutes");
        assert_eq!(text(Duration::from_secs(45)), "Agent timed out after 45 seconds");
        assert_eq!(text(Duration::from_secs(90)), "Agent timed out after 90 seconds");
        assert_eq!(text(Duration::from_millis(100)), "Agent timed out after 100 ms");
    }

    #[test]
    fn merge_error_failed_specs_lists_ids() {
        let err = MergeError::FailedSpecs(vec!["a".into(), "b".into()]);
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn merge_error_converts_from_state_error() {
        let err: MergeError = StateError::UnknownLayer("L9".into()).into();
        assert!(matches!(err, MergeError::State(StateError::UnknownLayer(_))));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StateError::UnknownSpec("x".into()));
        assert_std_error(&ExecutionError::Cancelled);
        assert_std_error(&WorktreeError::NotFound("x".into()));
        assert_std_error(&MergeError::NothingToContinue);
    }
}
