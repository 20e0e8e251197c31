//! Run-state store co-located with the definition document.
//!
//! The definition text is kept verbatim. Runtime state is serialized as YAML
//! after [`STATE_DELIMITER`], so one file describes both the plan and its
//! progress, and its canonical path identifies the run.
//!
//! Writes are atomic (temp file + rename) and happen immediately after every
//! transition. A writer holds an exclusive advisory lock on a sibling lock
//! file for as long as the store is open.

mod types;

pub use types::{
    CommitStatus, LockRecord, MergeStatus, RunInfo, RunState, RunStatus, SpecState, SpecStatus,
    StagingState,
};

use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::definition::SpecGraph;
use crate::errors::StateError;

/// Line separating the definition from orchard's runtime state.
pub const STATE_DELIMITER: &str =
    "# ---- orchard runtime state (managed by orchard; do not edit below) ----";

/// Split a document into its definition text and optional state text.
pub fn split_document(text: &str) -> (&str, Option<&str>) {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_end() == STATE_DELIMITER {
            let state_start = offset + line.len();
            return (&text[..offset], Some(&text[state_start..]));
        }
        offset += line.len();
    }
    (text, None)
}

/// Render definition text plus state back into one document.
fn render_document(definition: &str, state: &RunState) -> Result<String, serde_yaml::Error> {
    if state.is_empty() {
        return Ok(definition.to_string());
    }
    let mut out = String::with_capacity(definition.len() + 512);
    out.push_str(definition);
    if !definition.is_empty() && !definition.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(STATE_DELIMITER);
    out.push('\n');
    out.push_str(&serde_yaml::to_string(state)?);
    Ok(out)
}

fn parse_state(path: &Path, text: Option<&str>) -> Result<RunState, StateError> {
    match text {
        Some(t) if !t.trim().is_empty() => {
            serde_yaml::from_str(t).map_err(|e| StateError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
        _ => Ok(RunState::default()),
    }
}

/// Read the current state without taking the writer lock.
pub fn read_snapshot(path: &Path) -> Result<RunState, StateError> {
    let text = fs::read_to_string(path).map_err(|source| StateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let (_, state_text) = split_document(&text);
    parse_state(path, state_text)
}

/// Canonical path of a definition document; the run's identity.
pub fn run_id(path: &Path) -> Result<PathBuf, StateError> {
    path.canonicalize().map_err(|source| StateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Exclusive writer over a definition document's runtime state.
pub struct StateStore {
    path: PathBuf,
    definition: String,
    state: RunState,
    _lock: File,
}

impl StateStore {
    /// Open the document for writing. Fails with [`StateError::Busy`] when
    /// another process holds the writer lock.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        let path = run_id(path)?;
        let lock_path = lock_path(&path);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| StateError::Io {
                path: lock_path.clone(),
                source,
            })?;
        lock.try_lock_exclusive()
            .map_err(|_| StateError::Busy { path: path.clone() })?;

        let mut store = Self {
            path,
            definition: String::new(),
            state: RunState::default(),
            _lock: lock,
        };
        store.load()?;
        Ok(store)
    }

    /// Re-read the document from disk.
    pub fn load(&mut self) -> Result<(), StateError> {
        let text = fs::read_to_string(&self.path).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;
        let (definition, state_text) = split_document(&text);
        self.state = parse_state(&self.path, state_text)?;
        self.definition = definition.to_string();
        Ok(())
    }

    /// Atomically write definition text plus current state.
    pub fn save(&mut self) -> Result<(), StateError> {
        self.apply(|_| Ok(()))
    }

    /// Run `f` against a copy of the state and adopt the copy only once it
    /// is on disk, so a failed change or write leaves memory untouched.
    fn apply<T>(
        &mut self,
        f: impl FnOnce(&mut RunState) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut next = self.state.clone();
        let out = f(&mut next)?;
        next.run.updated_at = Some(Utc::now());
        self.write(&next)?;
        self.state = next;
        Ok(out)
    }

    fn write(&self, state: &RunState) -> Result<(), StateError> {
        let rendered =
            render_document(&self.definition, state).map_err(|e| StateError::Corrupt {
                path: self.path.clone(),
                message: e.to_string(),
            })?;

        let tmp = self.path.with_extension(format!(
            "{}.tmp",
            self.path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("yaml")
        ));
        let io_err = |source| StateError::Io {
            path: tmp.clone(),
            source,
        };
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(rendered.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn definition_text(&self) -> &str {
        &self.definition
    }

    /// Status of a spec; unknown specs read as pending.
    pub fn spec_status(&self, id: &str) -> SpecStatus {
        self.state.spec_status(id)
    }

    pub fn spec(&self, id: &str) -> Option<&SpecState> {
        self.state.specs.get(id)
    }

    pub fn layer(&self, id: &str) -> Option<&StagingState> {
        self.state.staging.get(id)
    }

    /// Mutate one spec record and persist immediately.
    pub fn update_spec<T>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut SpecState) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        self.apply(|state| {
            let entry = state
                .specs
                .get_mut(id)
                .ok_or_else(|| StateError::UnknownSpec(id.to_string()))?;
            f(entry)
        })
    }

    /// Mutate one layer's staging record and persist immediately.
    pub fn update_layer<T>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut StagingState) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        self.apply(|state| {
            let entry = state
                .staging
                .get_mut(id)
                .ok_or_else(|| StateError::UnknownLayer(id.to_string()))?;
            f(entry)
        })
    }

    /// Mutate the run-level record and persist immediately.
    pub fn update_run(&mut self, f: impl FnOnce(&mut RunInfo)) -> Result<(), StateError> {
        self.apply(|state| {
            f(&mut state.run);
            Ok(())
        })
    }

    /// Apply several changes in one write. Used for start-of-run
    /// normalisation where each change is part of one logical transition.
    pub fn update_all<T>(
        &mut self,
        f: impl FnOnce(&mut RunState) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        self.apply(f)
    }

    /// Make sure every spec and layer of `graph` has a record.
    pub fn ensure_graph(&mut self, graph: &SpecGraph) -> Result<(), StateError> {
        let missing = graph.specs().iter().any(|s| !self.state.specs.contains_key(&s.id))
            || graph
                .layers()
                .iter()
                .any(|l| !self.state.staging.contains_key(&l.id));
        if !missing {
            return Ok(());
        }
        self.apply(|state| {
            for spec in graph.specs() {
                state.specs.entry(spec.id.clone()).or_default();
            }
            for layer in graph.layers() {
                state.staging.entry(layer.id.clone()).or_default();
            }
            Ok(())
        })
    }

    /// Drop all runtime state, leaving the definition text untouched.
    pub fn fresh(&mut self) -> Result<(), StateError> {
        self.save_definition_only()?;
        self.state = RunState::default();
        Ok(())
    }

    fn save_definition_only(&mut self) -> Result<(), StateError> {
        let tmp = self.path.with_extension("fresh.tmp");
        fs::write(&tmp, self.definition.as_bytes()).map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "definition".to_string());
    path.with_file_name(format!(".{}.lock", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Definition, ValidateOptions, validate};
    use tempfile::tempdir;

    const DEF: &str = "\
layers:
  - id: L0
    specs:
      - id: a
        description: first
      - id: b
        description: second
";

    fn write_def(dir: &Path) -> PathBuf {
        let path = dir.join("plan.yaml");
        fs::write(&path, DEF).unwrap();
        path
    }

    fn graph() -> SpecGraph {
        let def = Definition::parse(DEF).unwrap();
        validate(&def, &ValidateOptions::default()).unwrap().graph
    }

    #[test]
    fn test_split_document_without_state() {
        let (def, state) = split_document(DEF);
        assert_eq!(def, DEF);
        assert!(state.is_none());
    }

    #[test]
    fn test_split_document_with_state() {
        let doc = format!("{}{}\nrun:\n  status: running\n", DEF, STATE_DELIMITER);
        let (def, state) = split_document(&doc);
        assert_eq!(def, DEF);
        assert_eq!(state, Some("run:\n  status: running\n"));
    }

    #[test]
    fn test_state_roundtrip_preserves_definition_bytes() {
        let dir = tempdir().unwrap();
        let path = write_def(dir.path());

        {
            let mut store = StateStore::open(&path).unwrap();
            store.ensure_graph(&graph()).unwrap();
            store
                .update_spec("a", |s| s.transition("a", SpecStatus::Running))
                .unwrap();
        }

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(DEF));
        assert!(text.contains(STATE_DELIMITER));

        let snapshot = read_snapshot(&path).unwrap();
        assert_eq!(snapshot.spec_status("a"), SpecStatus::Running);
        assert_eq!(snapshot.spec_status("b"), SpecStatus::Pending);
    }

    #[test]
    fn test_fresh_restores_definition_verbatim() {
        let dir = tempdir().unwrap();
        let path = write_def(dir.path());
        let mut store = StateStore::open(&path).unwrap();
        store.ensure_graph(&graph()).unwrap();
        store.fresh().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), DEF);
        assert!(store.state().is_empty());
    }

    #[test]
    fn test_second_writer_is_busy() {
        let dir = tempdir().unwrap();
        let path = write_def(dir.path());
        let _first = StateStore::open(&path).unwrap();
        let second = StateStore::open(&path);
        assert!(matches!(second, Err(StateError::Busy { .. })));
    }

    #[test]
    fn test_update_unknown_spec_errors() {
        let dir = tempdir().unwrap();
        let path = write_def(dir.path());
        let mut store = StateStore::open(&path).unwrap();
        let err = store.update_spec("ghost", |_| Ok(())).unwrap_err();
        assert!(matches!(err, StateError::UnknownSpec(_)));
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        let path = write_def(dir.path());
        let mut store = StateStore::open(&path).unwrap();
        store.ensure_graph(&graph()).unwrap();

        // A directory where the temp file belongs makes every write fail.
        fs::create_dir(dir.path().join("plan.yaml.tmp")).unwrap();
        let err = store
            .update_spec("a", |s| s.transition("a", SpecStatus::Running))
            .unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
        assert_eq!(store.spec_status("a"), SpecStatus::Pending);

        assert!(store.update_run(|run| run.status = RunStatus::Running).is_err());
        assert_ne!(store.state().run.status, RunStatus::Running);
    }

    #[test]
    fn test_corrupt_state_section_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.yaml");
        fs::write(&path, format!("{}{}\nspecs: [not, a, map\n", DEF, STATE_DELIMITER)).unwrap();
        assert!(matches!(
            read_snapshot(&path),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_reload_yields_same_state() {
        let dir = tempdir().unwrap();
        let path = write_def(dir.path());
        let mut store = StateStore::open(&path).unwrap();
        store.ensure_graph(&graph()).unwrap();
        store
            .update_layer("L0", |l| {
                l.record_merge("a");
                Ok(())
            })
            .unwrap();
        let before = store.state().clone();
        store.load().unwrap();
        assert_eq!(store.state(), &before);
    }
}
