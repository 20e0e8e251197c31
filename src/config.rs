//! Project configuration read from `.orchard/orchard.toml`.
//!
//! Layering, lowest to highest precedence: built-in defaults, the TOML file,
//! environment variables (`ORCHARD_AGENT`, `ORCHARD_AGENT_CMD`,
//! `ORCHARD_WORKTREE_ROOT`), then the definition's `execution` block and CLI
//! flags, which the `run` command applies on top.
//!
//! ```toml
//! [worktree]
//! root = ".orchard/worktrees"
//! copy_dirs = [".env.d"]
//! setup_script = "scripts/setup.sh"
//! setup_timeout_secs = 300
//! keep_on_failure = false
//!
//! [agent]
//! kind = "claude"
//! command = "claude"
//! args = []
//! structured_output = true
//!
//! [commit]
//! verify = true
//! retries = 2
//! action = "auto"
//!
//! [scheduler]
//! heartbeat_interval_secs = 15
//! stale_grace_secs = 120
//! poison_threshold = 3
//! cancel_grace_secs = 10
//! spec_root = "specs"
//!
//! [merge]
//! resolver_retries = 3
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::exec::{AgentKind, CommitAction};

/// Directory holding orchard's config, logs and default worktree root.
pub const ORCHARD_DIR: &str = ".orchard";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeSection {
    /// Where spec worktrees are created; relative paths resolve against the
    /// project directory.
    #[serde(default = "default_worktree_root")]
    pub root: PathBuf,
    /// Untracked directories copied from the source tree into each worktree.
    #[serde(default)]
    pub copy_dirs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<String>,
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,
    /// Leave a worktree in place when setup or validation fails.
    #[serde(default)]
    pub keep_on_failure: bool,
}

fn default_worktree_root() -> PathBuf {
    PathBuf::from(ORCHARD_DIR).join("worktrees")
}

fn default_setup_timeout_secs() -> u64 {
    300
}

impl Default for WorktreeSection {
    fn default() -> Self {
        Self {
            root: default_worktree_root(),
            copy_dirs: Vec::new(),
            setup_script: None,
            setup_timeout_secs: default_setup_timeout_secs(),
            keep_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub kind: AgentKind,
    /// Binary to invoke; defaults to the kind's usual command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Extra arguments, placed before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
    /// Ask the agent for machine-readable (JSON lines) output when its kind
    /// supports it.
    #[serde(default = "default_structured_output")]
    pub structured_output: bool,
}

fn default_structured_output() -> bool {
    true
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            kind: AgentKind::default(),
            command: None,
            args: Vec::new(),
            structured_output: default_structured_output(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSection {
    #[serde(default = "default_commit_verify")]
    pub verify: bool,
    #[serde(default = "default_commit_retries")]
    pub retries: u32,
    #[serde(default)]
    pub action: CommitAction,
}

fn default_commit_verify() -> bool {
    true
}

fn default_commit_retries() -> u32 {
    2
}

impl Default for CommitSection {
    fn default() -> Self {
        Self {
            verify: default_commit_verify(),
            retries: default_commit_retries(),
            action: CommitAction::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,
    #[serde(default = "default_poison_threshold")]
    pub poison_threshold: u32,
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// Directory of per-spec content folders.
    #[serde(default = "default_spec_root")]
    pub spec_root: PathBuf,
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_stale_grace_secs() -> u64 {
    120
}

fn default_poison_threshold() -> u32 {
    3
}

fn default_cancel_grace_secs() -> u64 {
    10
}

fn default_spec_root() -> PathBuf {
    PathBuf::from("specs")
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_grace_secs: default_stale_grace_secs(),
            poison_threshold: default_poison_threshold(),
            cancel_grace_secs: default_cancel_grace_secs(),
            spec_root: default_spec_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSection {
    /// Attempts the automated resolver gets before falling back to manual.
    #[serde(default = "default_resolver_retries")]
    pub resolver_retries: u32,
}

fn default_resolver_retries() -> u32 {
    3
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            resolver_retries: default_resolver_retries(),
        }
    }
}

/// The complete `orchard.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchardToml {
    #[serde(default)]
    pub worktree: WorktreeSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub commit: CommitSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub merge: MergeSection,
}

impl OrchardToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse orchard.toml")
    }

    /// Load `.orchard/orchard.toml` under `project_dir`, or defaults when absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(ORCHARD_DIR).join("orchard.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(kind) = lookup("ORCHARD_AGENT").filter(|v| !v.trim().is_empty()) {
            self.agent.kind = kind.parse()?;
        }
        if let Some(cmd) = lookup("ORCHARD_AGENT_CMD").filter(|v| !v.trim().is_empty()) {
            self.agent.command = Some(cmd);
        }
        if let Some(root) = lookup("ORCHARD_WORKTREE_ROOT").filter(|v| !v.trim().is_empty()) {
            self.worktree.root = PathBuf::from(root);
        }
        Ok(())
    }
}

/// Resolved project configuration.
#[derive(Debug, Clone)]
pub struct OrchardConfig {
    pub project_dir: PathBuf,
    pub orchard_dir: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub toml: OrchardToml,
}

impl OrchardConfig {
    /// Load file and environment layers for `project_dir`.
    pub fn load(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let mut toml = OrchardToml::load_or_default(&project_dir)?;
        toml.apply_env(|key| std::env::var(key).ok())?;
        Ok(Self::from_parts(project_dir, verbose, toml))
    }

    pub fn from_parts(project_dir: PathBuf, verbose: bool, toml: OrchardToml) -> Self {
        let orchard_dir = project_dir.join(ORCHARD_DIR);
        let log_dir = orchard_dir.join("logs");
        Self {
            project_dir,
            orchard_dir,
            log_dir,
            verbose,
            toml,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn worktree_root(&self) -> PathBuf {
        self.resolve(&self.toml.worktree.root)
    }

    pub fn spec_root(&self) -> PathBuf {
        self.resolve(&self.toml.scheduler.spec_root)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.worktree.setup_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.toml.scheduler.heartbeat_interval_secs.max(1))
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.toml.scheduler.stale_grace_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.toml.scheduler.cancel_grace_secs)
    }
}
