//! Merge-conflict context and resolution.
//!
//! When a spec branch does not merge cleanly into its staging branch, the
//! staging manager hands a [`ConflictContext`] to the [`ConflictResolver`].
//! In `manual` mode the context is rendered as a copy-pasteable block and the
//! run suspends until `merge --continue`. In `auto` mode the configured agent
//! is asked to resolve the files in place, falling back to manual when it
//! cannot.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::exec::{Agent, Invocation, InvocationEnd};
use crate::git::cli;

static MARKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(<{7}|>{7})(\s|$)").unwrap());

/// Lines of each side shown per hunk in the manual block.
const HUNK_PREVIEW_LINES: usize = 12;

/// How merge conflicts are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// Suspend the run and wait for `merge --continue`.
    #[default]
    Manual,
    /// Delegate to the configured agent, then fall back to manual.
    Auto,
}

impl std::fmt::Display for ConflictMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictMode::Manual => write!(f, "manual"),
            ConflictMode::Auto => write!(f, "auto"),
        }
    }
}

/// One `<<<<<<< / ======= / >>>>>>>` region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictHunk {
    pub ours: String,
    pub theirs: String,
    /// 1-based line of the first "ours" line in the conflicted file.
    pub ours_start: usize,
    /// 1-based line of the first "theirs" line in the conflicted file.
    pub theirs_start: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictFile {
    pub path: String,
    pub hunks: Vec<ConflictHunk>,
}

/// Everything needed to resolve one conflicted merge.
#[derive(Debug, Clone)]
pub struct ConflictContext {
    pub spec_id: String,
    pub description: String,
    /// Branch being merged in.
    pub source_branch: String,
    /// Staging branch receiving the merge.
    pub target_branch: String,
    /// Worktree holding the in-progress merge.
    pub workdir: PathBuf,
    pub files: Vec<ConflictFile>,
}

impl ConflictContext {
    /// Read the conflicted files in `workdir` and extract their hunks.
    pub fn collect(
        spec_id: &str,
        description: &str,
        source_branch: &str,
        target_branch: &str,
        workdir: &Path,
        paths: &[String],
    ) -> Self {
        let files = paths
            .iter()
            .map(|p| {
                let hunks = match std::fs::read_to_string(workdir.join(p)) {
                    Ok(text) => parse_conflict_hunks(&text),
                    Err(e) => {
                        // Binary files and delete/modify conflicts have no text hunks.
                        debug!(path = %p, error = %e, "cannot read conflicted file");
                        Vec::new()
                    }
                };
                ConflictFile {
                    path: p.clone(),
                    hunks,
                }
            })
            .collect();
        Self {
            spec_id: spec_id.to_string(),
            description: description.to_string(),
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            workdir: workdir.to_path_buf(),
            files,
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Self-contained instructions for resolving the conflict by hand.
    pub fn render_manual_block(&self, definition: &Path) -> String {
        let mut out = String::new();
        let rule = "=".repeat(72);
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "MERGE CONFLICT: spec '{}'", self.spec_id);
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "Spec:        {}", self.spec_id);
        let _ = writeln!(out, "Description: {}", self.description.trim());
        let _ = writeln!(out, "Merging:     {} -> {}", self.source_branch, self.target_branch);
        let _ = writeln!(out, "Resolve in:  {}", self.workdir.display());
        let _ = writeln!(out);
        let _ = writeln!(out, "Conflicted files:");
        for file in &self.files {
            let _ = writeln!(out, "  {} ({} hunk(s))", file.path, file.hunks.len());
            for (i, hunk) in file.hunks.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "    hunk {}: ours at line {}, theirs at line {}",
                    i + 1,
                    hunk.ours_start,
                    hunk.theirs_start
                );
                let _ = writeln!(out, "      ours ({}):", self.target_branch);
                push_preview(&mut out, &hunk.ours);
                let _ = writeln!(out, "      theirs ({}):", self.source_branch);
                push_preview(&mut out, &hunk.theirs);
            }
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "To resolve:");
        let _ = writeln!(out, "  cd {}", shell_quote(&self.workdir.to_string_lossy()));
        let _ = writeln!(out, "  # edit the files above and remove every conflict marker");
        let quoted: Vec<String> = self.files.iter().map(|f| shell_quote(&f.path)).collect();
        let _ = writeln!(out, "  git add {}", quoted.join(" "));
        let _ = writeln!(
            out,
            "  orchard merge {} --continue",
            shell_quote(&definition.to_string_lossy())
        );
        let _ = writeln!(out, "{}", rule);
        out
    }

    /// Prompt for an agent resolving the conflict in place.
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "You are resolving a git merge conflict in `{}`.\n",
            self.workdir.display()
        );
        let _ = writeln!(
            out,
            "Branch `{}` (spec '{}': {}) is being merged into `{}`.\n",
            self.source_branch,
            self.spec_id,
            self.description.trim(),
            self.target_branch
        );
        let _ = writeln!(out, "## Conflicted files\n");
        for file in &self.files {
            let _ = writeln!(out, "### {}\n", file.path);
            for hunk in &file.hunks {
                let _ = writeln!(
                    out,
                    "Ours (`{}`, line {}):\n```\n{}\n```\n",
                    self.target_branch, hunk.ours_start, hunk.ours
                );
                let _ = writeln!(
                    out,
                    "Theirs (`{}`, line {}):\n```\n{}\n```\n",
                    self.source_branch, hunk.theirs_start, hunk.theirs
                );
            }
        }
        let _ = writeln!(out, "## Instructions\n");
        let _ = writeln!(
            out,
            "1. Edit each conflicted file so that it keeps the intent of both sides."
        );
        let _ = writeln!(out, "2. Remove every conflict marker.");
        let _ = writeln!(out, "3. Stage each resolved file with `git add <path>`.");
        let _ = writeln!(out, "4. Do not commit and do not abort the merge.");
        out
    }
}

fn push_preview(out: &mut String, text: &str) {
    let lines: Vec<&str> = text.lines().collect();
    for line in lines.iter().take(HUNK_PREVIEW_LINES) {
        let _ = writeln!(out, "        | {}", line);
    }
    if lines.len() > HUNK_PREVIEW_LINES {
        let _ = writeln!(out, "        | ... ({} more lines)", lines.len() - HUNK_PREVIEW_LINES);
    }
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:@".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Extract conflict hunks from file text. A diff3 base section
/// (`|||||||`) is skipped.
pub fn parse_conflict_hunks(text: &str) -> Vec<ConflictHunk> {
    enum Section {
        Outside,
        Ours,
        Base,
        Theirs,
    }

    let mut hunks = Vec::new();
    let mut section = Section::Outside;
    let mut ours: Vec<&str> = Vec::new();
    let mut theirs: Vec<&str> = Vec::new();
    let mut ours_start = 0;
    let mut theirs_start = 0;

    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;
        match section {
            Section::Outside => {
                if line.starts_with("<<<<<<<") {
                    section = Section::Ours;
                    ours.clear();
                    theirs.clear();
                    ours_start = lineno + 1;
                }
            }
            Section::Ours | Section::Base => {
                if line.starts_with("|||||||") {
                    section = Section::Base;
                } else if line.starts_with("=======") {
                    section = Section::Theirs;
                    theirs_start = lineno + 1;
                } else if matches!(section, Section::Ours) {
                    ours.push(line);
                }
            }
            Section::Theirs => {
                if line.starts_with(">>>>>>>") {
                    hunks.push(ConflictHunk {
                        ours: ours.join("\n"),
                        theirs: theirs.join("\n"),
                        ours_start,
                        theirs_start,
                    });
                    section = Section::Outside;
                } else {
                    theirs.push(line);
                }
            }
        }
    }
    hunks
}

pub fn has_conflict_markers(text: &str) -> bool {
    MARKER_REGEX.is_match(text)
}

/// Files in `workdir` that still block a merge commit: git's unmerged paths
/// plus any of `paths` whose content still carries conflict markers.
pub async fn remaining_conflicts(workdir: &Path, paths: &[String]) -> anyhow::Result<Vec<String>> {
    let mut remaining = cli::unmerged_paths(workdir).await?;
    for path in paths {
        if remaining.contains(path) {
            continue;
        }
        if let Ok(text) = tokio::fs::read_to_string(workdir.join(path)).await
            && has_conflict_markers(&text)
        {
            remaining.push(path.clone());
        }
    }
    Ok(remaining)
}

/// Result of one resolution attempt.
#[derive(Debug)]
pub enum Resolution {
    /// Every file is resolved and staged; the merge can be committed.
    Resolved,
    /// The operator has to resolve it; the run suspends.
    Manual(ConflictContext),
}

pub struct ConflictResolver {
    mode: ConflictMode,
    agent: Option<Arc<dyn Agent>>,
    retries: u32,
    timeout: Duration,
}

impl ConflictResolver {
    pub fn new(mode: ConflictMode, agent: Option<Arc<dyn Agent>>, retries: u32) -> Self {
        Self {
            mode,
            agent,
            retries,
            timeout: Duration::from_secs(900),
        }
    }

    pub fn manual() -> Self {
        Self::new(ConflictMode::Manual, None, 0)
    }

    pub async fn resolve(
        &self,
        ctx: ConflictContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Resolution> {
        let agent = match (self.mode, &self.agent) {
            (ConflictMode::Auto, Some(agent)) => agent,
            (ConflictMode::Auto, None) => {
                warn!(spec = %ctx.spec_id, "auto conflict mode without an agent; falling back to manual");
                return Ok(Resolution::Manual(ctx));
            }
            (ConflictMode::Manual, _) => return Ok(Resolution::Manual(ctx)),
        };

        let paths = ctx.paths();
        for attempt in 1..=self.retries {
            if cancel.is_cancelled() {
                break;
            }
            info!(spec = %ctx.spec_id, attempt, files = paths.len(), "delegating conflict to agent");
            let invocation = Invocation {
                workdir: ctx.workdir.clone(),
                prompt: ctx.to_prompt(),
                timeout: self.timeout,
                log_file: None,
                stage_tx: None,
            };
            match agent.invoke(&invocation, cancel).await {
                Ok(out) if out.end == InvocationEnd::Cancelled => break,
                Ok(out) if !out.success() => {
                    warn!(spec = %ctx.spec_id, attempt, exit_code = ?out.exit_code, "resolver agent failed");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(spec = %ctx.spec_id, attempt, error = %e, "resolver agent could not run");
                    continue;
                }
            }

            stage_marker_free(&ctx.workdir, &paths).await?;
            let remaining = remaining_conflicts(&ctx.workdir, &paths).await?;
            if remaining.is_empty() {
                info!(spec = %ctx.spec_id, attempt, "conflict resolved by agent");
                return Ok(Resolution::Resolved);
            }
            debug!(spec = %ctx.spec_id, attempt, remaining = ?remaining, "conflict still unresolved");
        }

        warn!(spec = %ctx.spec_id, "automatic resolution exhausted; falling back to manual");
        let refreshed = match remaining_conflicts(&ctx.workdir, &paths).await {
            Ok(remaining) if !remaining.is_empty() => ConflictContext::collect(
                &ctx.spec_id,
                &ctx.description,
                &ctx.source_branch,
                &ctx.target_branch,
                &ctx.workdir,
                &remaining,
            ),
            _ => ctx,
        };
        Ok(Resolution::Manual(refreshed))
    }
}

/// Stage conflicted files the agent fixed but did not `git add`.
async fn stage_marker_free(workdir: &Path, paths: &[String]) -> anyhow::Result<()> {
    for path in paths {
        let full = workdir.join(path);
        let clean = match tokio::fs::read_to_string(&full).await {
            Ok(text) => !has_conflict_markers(&text),
            // Deleted on purpose, or binary; let git decide.
            Err(_) => false,
        };
        if clean {
            cli::git_checked(workdir, &["add", "--", path]).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{AgentKind, AgentProfile, ProcessAgent};
    use crate::git::MergeOutcome;
    use crate::git::test_support::{commit_file, setup_repo};
    use tempfile::tempdir;

    const CONFLICTED: &str = "\
fn main() {
<<<<<<< HEAD
    println!(\"ours\");
=======
    println!(\"theirs\");
    println!(\"more\");
>>>>>>> plan/api
}
<<<<<<< HEAD
a
||||||| base
b
=======
c
>>>>>>> plan/api
";

    #[test]
    fn test_parse_conflict_hunks() {
        let hunks = parse_conflict_hunks(CONFLICTED);
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0].ours, "    println!(\"ours\");");
        assert_eq!(hunks[0].ours_start, 3);
        assert_eq!(hunks[0].theirs_start, 5);
        assert!(hunks[0].theirs.contains("more"));
        assert_eq!(hunks[1].ours, "a");
        assert_eq!(hunks[1].theirs, "c");
    }

    #[test]
    fn test_has_conflict_markers() {
        assert!(has_conflict_markers(CONFLICTED));
        assert!(!has_conflict_markers("a\n=======\nb\n"));
        assert!(!has_conflict_markers("fn main() {}\n"));
    }

    fn context() -> ConflictContext {
        ConflictContext {
            spec_id: "api".into(),
            description: "Expose ledger API".into(),
            source_branch: "plan/api".into(),
            target_branch: "plan/staging/L0".into(),
            workdir: PathBuf::from("/repo/.orchard/worktrees/.staging/L0"),
            files: vec![ConflictFile {
                path: "src/lib.rs".into(),
                hunks: parse_conflict_hunks(CONFLICTED),
            }],
        }
    }

    #[test]
    fn test_manual_block_is_self_contained() {
        let block = context().render_manual_block(Path::new("plan.yaml"));
        assert!(block.contains("MERGE CONFLICT: spec 'api'"));
        assert!(block.contains("Expose ledger API"));
        assert!(block.contains("plan/api -> plan/staging/L0"));
        assert!(block.contains("src/lib.rs (2 hunk(s))"));
        assert!(block.contains("git add src/lib.rs"));
        assert!(block.contains("orchard merge plan.yaml --continue"));
    }

    #[test]
    fn test_prompt_lists_both_sides() {
        let prompt = context().to_prompt();
        assert!(prompt.contains("### src/lib.rs"));
        assert!(prompt.contains("println!(\"theirs\")"));
        assert!(prompt.contains("Do not commit"));
    }

    async fn conflicted_repo(dir: &Path) -> Vec<String> {
        setup_repo(dir);
        commit_file(dir, "shared.txt", "base\n", "base");
        cli::git_checked(dir, &["branch", "feature"]).await.unwrap();
        commit_file(dir, "shared.txt", "main side\n", "main");
        cli::git_checked(dir, &["checkout", "-q", "feature"]).await.unwrap();
        commit_file(dir, "shared.txt", "feature side\n", "feature");
        cli::git_checked(dir, &["checkout", "-q", "main"]).await.unwrap();
        match cli::merge_no_ff(dir, "feature", "merge feature").await.unwrap() {
            MergeOutcome::Conflicted { files } => files,
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_manual_mode_returns_context() {
        let dir = tempdir().unwrap();
        let files = conflicted_repo(dir.path()).await;
        let ctx = ConflictContext::collect("api", "d", "feature", "main", dir.path(), &files);
        assert_eq!(ctx.files[0].hunks.len(), 1);
        let resolution = ConflictResolver::manual()
            .resolve(ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Manual(_)));
    }

    #[tokio::test]
    async fn test_auto_mode_resolves_with_agent() {
        let dir = tempdir().unwrap();
        let files = conflicted_repo(dir.path()).await;
        let agent: Arc<dyn Agent> = Arc::new(ProcessAgent::new(AgentProfile {
            command: "sh".into(),
            base_args: vec!["-c".into(), "printf 'merged\\n' > shared.txt".into()],
            ..AgentProfile::builtin(AgentKind::Custom)
        }));
        let ctx = ConflictContext::collect("api", "d", "feature", "main", dir.path(), &files);
        let resolution = ConflictResolver::new(ConflictMode::Auto, Some(agent), 3)
            .resolve(ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Resolved));
        assert!(cli::unmerged_paths(dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_mode_falls_back_to_manual() {
        let dir = tempdir().unwrap();
        let files = conflicted_repo(dir.path()).await;
        let agent: Arc<dyn Agent> = Arc::new(ProcessAgent::new(AgentProfile {
            command: "true".into(),
            ..AgentProfile::builtin(AgentKind::Custom)
        }));
        let ctx = ConflictContext::collect("api", "d", "feature", "main", dir.path(), &files);
        let resolution = ConflictResolver::new(ConflictMode::Auto, Some(agent), 2)
            .resolve(ctx, &CancellationToken::new())
            .await
            .unwrap();
        match resolution {
            Resolution::Manual(ctx) => assert_eq!(ctx.paths(), vec!["shared.txt".to_string()]),
            other => panic!("expected manual fallback, got {:?}", other),
        }
    }
}
