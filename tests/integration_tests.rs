//! Integration tests for the orchard CLI.
//!
//! These drive the compiled binary against scratch git repositories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create an orchard Command
fn orchard() -> Command {
    cargo_bin_cmd!("orchard")
}

fn git(dir: &Path, args: &[&str]) -> String {
    let out = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A repository on `main` with one commit; orchard's own files are ignored.
fn create_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let p = dir.path();
    git(p, &["init", "-q"]);
    git(p, &["checkout", "-q", "-b", "main"]);
    git(p, &["config", "user.name", "test"]);
    git(p, &["config", "user.email", "test@test.com"]);
    git(p, &["config", "commit.gpgsign", "false"]);
    fs::write(p.join("README.md"), "hello\n").unwrap();
    fs::write(p.join(".gitignore"), ".orchard/\nplan.yaml\n").unwrap();
    git(p, &["add", "-A"]);
    git(p, &["commit", "-qm", "init"]);
    dir
}

const PLAN: &str = "\
schema_version: 1
metadata:
  name: demo
  id: demo
execution:
  max_parallel: 2
  base_branch: main
layers:
  - id: L0
    name: Foundations
    specs:
      - id: a
        description: First piece
      - id: b
        description: Second piece
  - id: L1
    depends_on: [L0]
    specs:
      - id: c
        description: Builds on both
        depends_on: [a, b]
";

fn write_plan(dir: &TempDir, text: &str) {
    fs::write(dir.path().join("plan.yaml"), text).unwrap();
}

/// Configure a scripted agent that commits one file named after its worktree.
fn scripted_agent(dir: &TempDir) {
    let orchard_dir = dir.path().join(".orchard");
    fs::create_dir_all(&orchard_dir).unwrap();
    fs::write(
        orchard_dir.join("orchard.toml"),
        r#"
[agent]
kind = "custom"
command = "sh"
args = ["-c", '''cat >/dev/null; echo "<stage>implement</stage>"; basename "$PWD" > "$(basename "$PWD").txt"; git add -A && git commit -qm work''']

[scheduler]
heartbeat_interval_secs = 1
"#,
    )
    .unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        orchard().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        orchard().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_is_invalid() {
        orchard().arg("frobnicate").assert().code(3);
    }

    #[test]
    fn test_missing_definition_argument_is_invalid() {
        orchard().arg("run").assert().code(3);
    }
}

// =============================================================================
// Definition Validation
// =============================================================================

mod validation {
    use super::*;

    #[test]
    fn test_cycle_is_rejected_with_exit_3() {
        let dir = create_repo();
        write_plan(
            &dir,
            "layers:\n  - id: L0\n    specs:\n      - id: A\n        description: a\n        depends_on: [B]\n      - id: B\n        description: b\n        depends_on: [A]\n",
        );
        orchard()
            .current_dir(dir.path())
            .args(["run", "plan.yaml", "--dry-run"])
            .assert()
            .code(3)
            .stderr(predicate::str::contains("cycle"));
    }

    #[test]
    fn test_dangling_dependency_is_rejected() {
        let dir = create_repo();
        write_plan(
            &dir,
            "layers:\n  - id: L0\n    specs:\n      - id: A\n        description: a\n        depends_on: [ghost]\n",
        );
        orchard()
            .current_dir(dir.path())
            .args(["status", "plan.yaml"])
            .assert()
            .code(3)
            .stderr(predicate::str::contains("ghost"));
    }

    #[test]
    fn test_missing_definition_file() {
        let dir = create_repo();
        orchard()
            .current_dir(dir.path())
            .args(["run", "nope.yaml", "--dry-run"])
            .assert()
            .code(3);
    }

    #[test]
    fn test_unknown_only_id_is_invalid() {
        let dir = create_repo();
        write_plan(&dir, PLAN);
        orchard()
            .current_dir(dir.path())
            .args(["run", "plan.yaml", "--dry-run", "--only", "zz"])
            .assert()
            .code(3)
            .stderr(predicate::str::contains("unknown spec id 'zz'"));
    }
}

// =============================================================================
// Dry Run and Status
// =============================================================================

mod planning {
    use super::*;

    #[test]
    fn test_dry_run_prints_waves_without_touching_state() {
        let dir = create_repo();
        write_plan(&dir, PLAN);
        orchard()
            .current_dir(dir.path())
            .args(["run", "plan.yaml", "--dry-run", "--parallel"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Layer L0"))
            .stdout(predicate::str::contains("wave 1: a, b"))
            .stdout(predicate::str::contains("Layer L1"))
            .stdout(predicate::str::contains("Max parallel: 2"));

        let text = fs::read_to_string(dir.path().join("plan.yaml")).unwrap();
        assert_eq!(text, PLAN);
        assert!(!dir.path().join(".orchard/worktrees").exists());
    }

    #[test]
    fn test_dry_run_is_sequential_by_default() {
        let dir = create_repo();
        write_plan(&dir, PLAN);
        orchard()
            .current_dir(dir.path())
            .args(["run", "plan.yaml", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Max parallel: 1"));
    }

    #[test]
    fn test_status_json_before_any_run() {
        let dir = create_repo();
        write_plan(&dir, PLAN);
        let out = orchard()
            .current_dir(dir.path())
            .args(["status", "plan.yaml", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["run"]["status"], "idle");
        assert_eq!(json["specs"].as_array().unwrap().len(), 3);
        assert_eq!(json["specs"][0]["status"], "pending");
        assert_eq!(json["layers"][1]["id"], "L1");
    }

    #[test]
    fn test_merge_continue_with_nothing_pending_fails() {
        let dir = create_repo();
        write_plan(&dir, PLAN);
        orchard()
            .current_dir(dir.path())
            .args(["merge", "plan.yaml", "--continue"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("No merge is waiting"));
    }

    #[test]
    fn test_final_merge_refuses_incomplete_layers() {
        let dir = create_repo();
        write_plan(&dir, PLAN);
        orchard()
            .current_dir(dir.path())
            .args(["merge", "plan.yaml"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("not complete"));
    }
}

// =============================================================================
// End-to-end Runs
// =============================================================================

mod end_to_end {
    use super::*;

    #[test]
    fn test_run_status_merge_cleanup() {
        let dir = create_repo();
        write_plan(&dir, PLAN);
        scripted_agent(&dir);

        orchard()
            .current_dir(dir.path())
            .args(["run", "plan.yaml", "--parallel"])
            .assert()
            .success()
            .stdout(predicate::str::contains("a completed"))
            .stdout(predicate::str::contains("layer L1 complete"));

        // The state section was appended to the document.
        let text = fs::read_to_string(dir.path().join("plan.yaml")).unwrap();
        assert!(text.starts_with(PLAN));
        assert!(text.len() > PLAN.len());

        let out = orchard()
            .current_dir(dir.path())
            .args(["status", "plan.yaml", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["run"]["status"], "completed");
        for spec in json["specs"].as_array().unwrap() {
            assert_eq!(spec["status"], "completed");
            assert_eq!(spec["merge_status"], "merged");
        }

        // c was built on top of L0's staging branch.
        let c_files = git(dir.path(), &["ls-tree", "--name-only", "demo/spec/c"]);
        assert!(c_files.contains("a.txt"));
        assert!(c_files.contains("b.txt"));

        // A second run has nothing left to do.
        orchard()
            .current_dir(dir.path())
            .args(["run", "plan.yaml"])
            .assert()
            .success()
            .stdout(predicate::str::contains("▶").not());

        orchard()
            .current_dir(dir.path())
            .args(["merge", "plan.yaml"])
            .assert()
            .success()
            .stdout(predicate::str::contains("into main"));
        assert!(dir.path().join("c.txt").exists());
        assert!(dir.path().join("a.txt").exists());

        orchard()
            .current_dir(dir.path())
            .args(["cleanup", "plan.yaml"])
            .assert()
            .success();
        assert!(!dir.path().join(".orchard/worktrees/a").exists());
        assert!(!dir.path().join(".orchard/worktrees/.staging/L0").exists());
    }

    #[test]
    fn test_failing_agent_exits_1_and_blocks_dependents() {
        let dir = create_repo();
        write_plan(&dir, PLAN);
        let orchard_dir = dir.path().join(".orchard");
        fs::create_dir_all(&orchard_dir).unwrap();
        fs::write(
            orchard_dir.join("orchard.toml"),
            "[agent]\nkind = \"custom\"\ncommand = \"sh\"\nargs = [\"-c\", \"cat >/dev/null; exit 7\"]\n",
        )
        .unwrap();

        orchard()
            .current_dir(dir.path())
            .args(["run", "plan.yaml", "--parallel"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("c blocked"));

        let out = orchard()
            .current_dir(dir.path())
            .args(["status", "plan.yaml", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["specs"][0]["status"], "failed");
        assert_eq!(json["specs"][2]["status"], "blocked");
        assert!(
            json["specs"][0]["failure_reason"]
                .as_str()
                .unwrap()
                .contains("non-zero code 7")
        );
    }
}
