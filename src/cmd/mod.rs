//! CLI command implementations.
//!
//! | Module    | Commands handled           |
//! |-----------|----------------------------|
//! | `run`     | `Run`                      |
//! | `status`  | `Status`                   |
//! | `merge`   | `Merge`, `Merge --continue`|
//! | `cleanup` | `Cleanup`                  |

pub mod cleanup;
pub mod merge;
pub mod run;
pub mod status;

pub use cleanup::cmd_cleanup;
pub use merge::{cmd_merge, cmd_merge_continue};
pub use run::{RunOptions, cmd_run};
pub use status::cmd_status;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use orchard::config::OrchardConfig;
use orchard::definition::{Diagnostic, ValidateOptions, Validated, load_definition};
use orchard::git::GitRepo;
use orchard::worktree::{WorktreeManager, WorktreeOptions};

/// Configuration plus the validated definition every command starts from.
pub struct Project {
    pub config: OrchardConfig,
    /// Canonical definition path; also the run identity.
    pub definition: PathBuf,
    pub validated: Validated,
}

impl Project {
    pub fn load(project_dir: &Path, definition: &Path, verbose: bool) -> Result<Self> {
        let config = OrchardConfig::load(project_dir, verbose)?;
        let definition = if definition.is_absolute() {
            definition.to_path_buf()
        } else {
            config.project_dir.join(definition)
        };
        let opts = ValidateOptions {
            spec_root: Some(config.spec_root()),
        };
        let validated = load_definition(&definition, &opts)?;
        let definition = definition
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", definition.display()))?;
        Ok(Self {
            config,
            definition,
            validated,
        })
    }

    pub fn worktrees(&self) -> Result<WorktreeManager> {
        let git = GitRepo::open(&self.config.project_dir)?;
        let section = &self.config.toml.worktree;
        let options = WorktreeOptions {
            copy_dirs: section.copy_dirs.clone(),
            setup_script: section.setup_script.clone(),
            setup_timeout: self.config.setup_timeout(),
            keep_on_failure: section.keep_on_failure,
        };
        Ok(WorktreeManager::new(
            git,
            self.config.worktree_root(),
            options,
        ))
    }
}

pub fn print_warnings(warnings: &[Diagnostic]) {
    for warning in warnings {
        eprintln!("{} {}", console::style("warning:").yellow().bold(), warning);
    }
}

pub fn print_error(e: &anyhow::Error) {
    eprintln!("{} {:#}", console::style("error:").red().bold(), e);
}
