//! Diagnostic tracing.
//!
//! Two sinks:
//! - stderr, compact, filtered by `RUST_LOG` (default `warn`; `--verbose`
//!   raises orchard's own events to `debug`)
//! - a daily-rotated JSON file under `.orchard/logs/`, always at `debug` for
//!   orchard so a failed run can be inspected after the fact
//!
//! User-facing output (plans, tables, conflict blocks) is not tracing; it is
//! printed to stdout by the commands.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// File name prefix of the rotated log files.
pub const LOG_FILE_PREFIX: &str = "orchard.log";

fn stderr_filter(verbose: bool) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => EnvFilter::new("warn,orchard=debug"),
        Err(_) => EnvFilter::new("warn"),
    }
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process so buffered file output is flushed on exit.
///
/// When `log_dir` is `None` or cannot be created, only the stderr sink is
/// installed.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(stderr_filter(verbose));

    let file = log_dir.and_then(|dir| std::fs::create_dir_all(dir).ok().map(|_| dir));

    match file {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("info,orchard=debug"));
            let _ = tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry().with(stderr_layer).try_init();
            None
        }
    }
}
