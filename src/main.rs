use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use orchard::errors::DefinitionError;
use orchard::exit_codes;

mod cmd;

#[derive(Parser)]
#[command(name = "orchard")]
#[command(
    version,
    about = "Run layered specs in parallel git worktrees and merge them through staging branches"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a definition, resuming from its persisted state
    Run {
        /// Path to the definition document
        definition: PathBuf,

        /// Run up to the definition's `max_parallel` specs at once
        #[arg(long)]
        parallel: bool,

        /// Override the parallel bound (implies --parallel)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Discard persisted run state before starting
        #[arg(long)]
        fresh: bool,

        /// Only dispatch these specs (comma-separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Remove worktrees and branches of unfinished specs before starting
        #[arg(long)]
        clean: bool,

        /// Validate and print the execution plan without running anything
        #[arg(long)]
        dry_run: bool,

        /// Force these specs back to pending, poisoned ones included (comma-separated)
        #[arg(long, value_delimiter = ',')]
        retry: Vec<String>,

        /// Stop dispatching after the first failure
        #[arg(long)]
        fail_fast: bool,
    },
    /// Show per-spec and per-layer state
    Status {
        definition: PathBuf,

        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Merge the last layer's staging branch, or finish a suspended merge
    Merge {
        definition: PathBuf,

        /// Target branch (defaults to the definition's base branch)
        #[arg(long)]
        branch: Option<String>,

        /// Commit a staging merge whose conflicts have been resolved and staged
        #[arg(long = "continue")]
        continue_merge: bool,

        /// Allow the final merge when some specs did not complete
        #[arg(long)]
        skip_failed: bool,
    },
    /// Remove spec and staging worktrees
    Cleanup {
        definition: PathBuf,

        /// Remove worktrees even with uncommitted or unmerged work
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            };
            let _ = e.print();
            return exit(code);
        }
    };

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                cmd::print_error(&anyhow::anyhow!("Failed to get current directory: {}", e));
                return exit(exit_codes::FAILED);
            }
        },
    };

    let log_dir = match &cli.command {
        Commands::Status { .. } => None,
        _ => Some(project_dir.join(orchard::config::ORCHARD_DIR).join("logs")),
    };
    let _log_guard = orchard::logging::init(cli.verbose, log_dir.as_deref());

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received; letting in-flight specs wind down...");
            signal.cancel();
        }
    });

    let result = match &cli.command {
        Commands::Run {
            definition,
            parallel,
            max_parallel,
            fresh,
            only,
            clean,
            dry_run,
            retry,
            fail_fast,
        } => {
            let options = cmd::RunOptions {
                definition: definition.clone(),
                parallel: *parallel,
                max_parallel: *max_parallel,
                fresh: *fresh,
                only: only.clone(),
                clean: *clean,
                dry_run: *dry_run,
                retry: retry.clone(),
                fail_fast: *fail_fast,
            };
            cmd::cmd_run(&cli, &project_dir, options, cancel).await
        }
        Commands::Status { definition, json } => {
            cmd::cmd_status(&cli, &project_dir, definition, *json)
        }
        Commands::Merge {
            definition,
            branch,
            continue_merge,
            skip_failed,
        } => {
            if *continue_merge {
                cmd::cmd_merge_continue(&cli, &project_dir, definition).await
            } else {
                cmd::cmd_merge(
                    &cli,
                    &project_dir,
                    definition,
                    branch.as_deref(),
                    *skip_failed,
                )
                .await
            }
        }
        Commands::Cleanup { definition, force } => {
            cmd::cmd_cleanup(&cli, &project_dir, definition, *force).await
        }
    };

    match result {
        Ok(code) => exit(code),
        Err(e) => {
            cmd::print_error(&e);
            if e.downcast_ref::<DefinitionError>().is_some() {
                exit(exit_codes::INVALID)
            } else {
                exit(exit_codes::FAILED)
            }
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
