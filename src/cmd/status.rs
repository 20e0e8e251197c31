//! `orchard status`: per-spec and per-layer state, as a table or JSON.

use anyhow::Result;
use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;
use std::path::{Path, PathBuf};

use orchard::definition::SpecGraph;
use orchard::exit_codes;
use orchard::state::{MergeStatus, RunInfo, RunState, SpecStatus, read_snapshot};

use super::super::Cli;
use super::{Project, print_warnings};

#[derive(Debug, Serialize)]
struct SpecRow {
    id: String,
    layer: String,
    status: SpecStatus,
    /// The owner's heartbeat is older than the stale grace.
    stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    attempts: u32,
    merge_status: MergeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    worktree: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct LayerRow {
    id: String,
    complete: bool,
    merged: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_conflict: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    definition: PathBuf,
    run: RunInfo,
    specs: Vec<SpecRow>,
    layers: Vec<LayerRow>,
}

fn build_report(
    definition: &Path,
    graph: &SpecGraph,
    state: &RunState,
    now: DateTime<Utc>,
    stale_grace: chrono::Duration,
) -> StatusReport {
    let specs = graph
        .specs()
        .iter()
        .map(|spec| {
            let s = state.specs.get(&spec.id).cloned().unwrap_or_default();
            let stale = s.status == SpecStatus::Running
                && s.lock.as_ref().is_none_or(|l| l.is_stale(now, stale_grace));
            SpecRow {
                id: spec.id.clone(),
                layer: spec.layer.clone(),
                status: s.status,
                stale,
                stage: s.stage,
                attempts: s.attempts,
                merge_status: s.merge_status,
                failed_stage: s.failed_stage,
                failure_reason: s.failure_reason,
                branch: s.branch,
                worktree: s.worktree,
                duration_ms: s.duration_ms,
            }
        })
        .collect();
    let layers = graph
        .layers()
        .iter()
        .map(|layer| {
            let l = state.staging.get(&layer.id).cloned().unwrap_or_default();
            LayerRow {
                id: layer.id.clone(),
                complete: l.complete,
                merged: l.merged,
                branch: l.branch,
                pending_conflict: l.pending_conflict,
            }
        })
        .collect();
    StatusReport {
        definition: definition.to_path_buf(),
        run: state.run.clone(),
        specs,
        layers,
    }
}

pub fn cmd_status(cli: &Cli, project_dir: &Path, definition: &Path, json: bool) -> Result<i32> {
    let project = Project::load(project_dir, definition, cli.verbose)?;
    let state = read_snapshot(&project.definition)?;
    let grace = chrono::Duration::from_std(project.config.stale_grace())
        .unwrap_or(chrono::Duration::MAX);
    let report = build_report(
        &project.definition,
        &project.validated.graph,
        &state,
        Utc::now(),
        grace,
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(exit_codes::OK);
    }

    print_warnings(&project.validated.warnings);
    print_table(&report);
    Ok(exit_codes::OK)
}

fn styled_status(row: &SpecRow) -> String {
    let text = if row.stale {
        format!("{} (stale)", row.status)
    } else {
        row.status.to_string()
    };
    let padded = format!("{:<13}", text);
    match row.status {
        SpecStatus::Completed => style(padded).green().to_string(),
        SpecStatus::Failed | SpecStatus::Poison | SpecStatus::Blocked => {
            style(padded).red().to_string()
        }
        SpecStatus::Running | SpecStatus::Interrupted => style(padded).yellow().to_string(),
        SpecStatus::Pending => style(padded).dim().to_string(),
    }
}

fn print_table(report: &StatusReport) {
    println!();
    println!("{}", style("Orchard Status").bold().cyan());
    println!("─────────────────────────");
    println!("Definition: {}", report.definition.display());
    println!("Run: {}", report.run.status);
    if let Some(started) = report.run.started_at {
        println!("Started: {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    println!(
        "{:<20} {:<8} {:<13} {:<8} {:<10} Stage",
        "Spec", "Layer", "Status", "Tries", "Merge"
    );
    println!(
        "{:<20} {:<8} {:<13} {:<8} {:<10} -----",
        "--------------------", "--------", "-------------", "--------", "----------"
    );
    for row in &report.specs {
        let merge = match row.merge_status {
            MergeStatus::Merged => "merged",
            MergeStatus::Conflicted => "conflict",
            MergeStatus::Unmerged => "-",
        };
        println!(
            "{:<20} {:<8} {} {:<8} {:<10} {}",
            row.id,
            row.layer,
            styled_status(row),
            row.attempts,
            merge,
            row.stage.as_deref().unwrap_or("")
        );
        if let Some(reason) = &row.failure_reason {
            println!(
                "  {} {}: {}",
                style("└").dim(),
                row.failed_stage.as_deref().unwrap_or("?"),
                reason.lines().next().unwrap_or("")
            );
        }
    }
    println!();
    for layer in &report.layers {
        let state = if layer.complete {
            style("complete").green().to_string()
        } else {
            style("open").dim().to_string()
        };
        println!(
            "Layer {:<8} {}  merged: {}",
            layer.id,
            state,
            if layer.merged.is_empty() {
                "-".to_string()
            } else {
                layer.merged.join(", ")
            }
        );
        if let Some(spec) = &layer.pending_conflict {
            println!(
                "  {} merge of {} is waiting on a conflict resolution (`orchard merge --continue`)",
                style("!").red().bold(),
                spec
            );
        }
    }
    println!();
}
