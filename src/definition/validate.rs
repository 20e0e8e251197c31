//! Structural validation of a parsed definition.
//!
//! Checks run in a fixed order: required fields, id uniqueness, reference
//! resolution, backward cross-layer references, cycles, and finally content
//! folders (warnings only). Errors within a stage are collected so one run
//! reports every problem of that kind.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use regex::Regex;

use super::graph::{Layer, Spec, SpecGraph};
use super::model::{ExecutionSettings, SUPPORTED_SCHEMA_VERSION, schema_version_number};
use super::{Definition, Diagnostic};
use crate::errors::DefinitionError;

/// Options that influence validation without being part of the document.
#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    /// Directory holding one content folder per spec id. When unset, the
    /// content-folder check is skipped.
    pub spec_root: Option<PathBuf>,
}

/// A successfully validated graph plus any non-fatal findings.
#[derive(Debug, Clone)]
pub struct Validated {
    pub graph: SpecGraph,
    pub warnings: Vec<Diagnostic>,
}

/// Validate a parsed definition and build its graph.
pub fn validate(def: &Definition, opts: &ValidateOptions) -> Result<Validated, DefinitionError> {
    let raw = def.raw();
    let lines = LineIndex::new(def.source());
    let mut warnings = Vec::new();

    if let Some(version) = &raw.schema_version {
        match schema_version_number(version) {
            Some(SUPPORTED_SCHEMA_VERSION) => {}
            _ => warnings.push(Diagnostic::new(
                lines.key("schema_version"),
                format!(
                    "unsupported schema_version {}; parsing best-effort as version {}",
                    render_value(version),
                    SUPPORTED_SCHEMA_VERSION
                ),
            )),
        }
    }

    // 1. Required fields.
    let mut errors = Vec::new();
    let Some(raw_layers) = raw.layers.as_ref() else {
        return Err(DefinitionError::Invalid(vec![Diagnostic::new(
            None,
            "missing required field 'layers'",
        )]));
    };
    if raw_layers.is_empty() {
        return Err(DefinitionError::Invalid(vec![Diagnostic::new(
            lines.key("layers"),
            "'layers' must declare at least one layer",
        )]));
    }

    let mut layers: Vec<Layer> = Vec::new();
    let mut specs: Vec<Spec> = Vec::new();

    for (li, raw_layer) in raw_layers.iter().enumerate() {
        let layer_id = match raw_layer.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                errors.push(Diagnostic::new(
                    None,
                    format!("layer #{} is missing required field 'id'", li + 1),
                ));
                format!("#{}", li + 1)
            }
        };
        if !layer_id.starts_with('#') && !is_valid_id(&layer_id) {
            errors.push(Diagnostic::new(
                lines.id(&layer_id, 0),
                format!(
                    "layer id '{}' may only contain letters, digits, '.', '_' and '-'",
                    layer_id
                ),
            ));
        }

        let Some(raw_specs) = raw_layer.specs.as_ref() else {
            errors.push(Diagnostic::new(
                lines.id(&layer_id, 0),
                format!("layer '{}' is missing required field 'specs'", layer_id),
            ));
            continue;
        };
        if raw_specs.is_empty() {
            warnings.push(Diagnostic::new(
                lines.id(&layer_id, 0),
                format!("layer '{}' declares no specs", layer_id),
            ));
        }

        let mut layer_specs = Vec::new();
        for (si, raw_spec) in raw_specs.iter().enumerate() {
            let spec_id = match raw_spec.id.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    errors.push(Diagnostic::new(
                        None,
                        format!(
                            "spec #{} of layer '{}' is missing required field 'id'",
                            si + 1,
                            layer_id
                        ),
                    ));
                    continue;
                }
            };
            if !is_valid_id(&spec_id) {
                errors.push(Diagnostic::new(
                    lines.id(&spec_id, 0),
                    format!(
                        "spec id '{}' may only contain letters, digits, '.', '_' and '-'",
                        spec_id
                    ),
                ));
            }
            let description = raw_spec
                .description
                .as_deref()
                .map(str::trim)
                .unwrap_or_default();
            if description.is_empty() {
                errors.push(Diagnostic::new(
                    lines.id(&spec_id, 0),
                    format!("spec '{}' is missing required field 'description'", spec_id),
                ));
            }
            if raw_spec.timeout_minutes == Some(0) {
                errors.push(Diagnostic::new(
                    lines.id(&spec_id, 0),
                    format!("spec '{}' has timeout_minutes 0; it must be at least 1", spec_id),
                ));
            }

            layer_specs.push(spec_id.clone());
            specs.push(Spec {
                id: spec_id,
                description: description.to_string(),
                depends_on: raw_spec.depends_on.clone(),
                timeout_minutes: raw_spec.timeout_minutes,
                layer: layer_id.clone(),
                layer_index: li,
            });
        }

        layers.push(Layer {
            id: layer_id,
            name: raw_layer.name.clone(),
            depends_on: raw_layer.depends_on.clone(),
            specs: layer_specs,
            index: li,
        });
    }

    // 2. Uniqueness: layers first, then specs globally.
    let mut seen_layers: HashMap<&str, usize> = HashMap::new();
    for layer in &layers {
        let count = seen_layers.entry(layer.id.as_str()).or_insert(0);
        *count += 1;
        if *count == 2 {
            errors.push(Diagnostic::new(
                lines.id(&layer.id, 1),
                format!("duplicate layer id '{}'", layer.id),
            ));
        }
    }
    let mut seen_specs: HashMap<&str, usize> = HashMap::new();
    for spec in &specs {
        let count = seen_specs.entry(spec.id.as_str()).or_insert(0);
        *count += 1;
        if *count == 2 {
            errors.push(Diagnostic::new(
                lines.id(&spec.id, 1),
                format!("duplicate spec id '{}'", spec.id),
            ));
        }
    }

    // 3. Every reference resolves.
    let layer_index: HashMap<&str, usize> = layers.iter().map(|l| (l.id.as_str(), l.index)).collect();
    let spec_layer: HashMap<&str, usize> = specs.iter().map(|s| (s.id.as_str(), s.layer_index)).collect();

    for layer in &layers {
        for dep in &layer.depends_on {
            if !layer_index.contains_key(dep.as_str()) {
                errors.push(Diagnostic::new(
                    lines.id(&layer.id, 0),
                    format!("layer '{}' depends on unknown layer '{}'", layer.id, dep),
                ));
            }
        }
    }
    for spec in &specs {
        for dep in &spec.depends_on {
            if !spec_layer.contains_key(dep.as_str()) {
                errors.push(Diagnostic::new(
                    lines.id(&spec.id, 0),
                    format!("spec '{}' depends on unknown spec '{}'", spec.id, dep),
                ));
            }
        }
    }

    if !errors.is_empty() {
        return Err(DefinitionError::Invalid(errors));
    }

    // 4. Backward cross-layer references.
    for layer in &layers {
        for dep in &layer.depends_on {
            let later = layer_index
                .get(dep.as_str())
                .is_some_and(|&dep_index| dep_index > layer.index);
            if later {
                errors.push(Diagnostic::new(
                    lines.id(&layer.id, 0),
                    format!(
                        "layer '{}' depends on later layer '{}'; layers may only depend on earlier layers",
                        layer.id, dep
                    ),
                ));
            }
        }
    }
    for spec in &specs {
        for dep in &spec.depends_on {
            let Some(&dep_layer) = spec_layer.get(dep.as_str()) else {
                continue;
            };
            if dep_layer > spec.layer_index {
                errors.push(Diagnostic::new(
                    lines.id(&spec.id, 0),
                    format!(
                        "spec '{}' in layer '{}' depends on '{}' in later layer '{}'",
                        spec.id, spec.layer, dep, layers[dep_layer].id
                    ),
                ));
            }
        }
    }

    // 5. Cycles: layer relation first, then the effective spec relation.
    let layer_edges: Vec<Vec<usize>> = layers
        .iter()
        .map(|l| {
            l.depends_on
                .iter()
                .filter_map(|d| layer_index.get(d.as_str()).copied())
                .collect()
        })
        .collect();
    for cycle in find_cycles(&layer_edges) {
        let path: Vec<&str> = cycle.iter().map(|&i| layers[i].id.as_str()).collect();
        errors.push(Diagnostic::new(
            lines.id(path[0], 0),
            format!("layer dependency cycle detected: {}", path.join(" -> ")),
        ));
    }

    let spec_index: HashMap<&str, usize> = specs.iter().enumerate().map(|(i, s)| (s.id.as_str(), i)).collect();
    let spec_edges: Vec<Vec<usize>> = specs
        .iter()
        .map(|s| {
            let mut deps: Vec<usize> = s
                .depends_on
                .iter()
                .filter_map(|d| spec_index.get(d.as_str()).copied())
                .collect();
            for dep_layer in &layers[s.layer_index].depends_on {
                if let Some(&li) = layer_index.get(dep_layer.as_str()) {
                    deps.extend(
                        layers[li]
                            .specs
                            .iter()
                            .filter_map(|d| spec_index.get(d.as_str()).copied()),
                    );
                }
            }
            deps
        })
        .collect();
    for cycle in find_cycles(&spec_edges) {
        let path: Vec<&str> = cycle.iter().map(|&i| specs[i].id.as_str()).collect();
        errors.push(Diagnostic::new(
            lines.id(path[0], 0),
            format!("dependency cycle detected: {}", path.join(" -> ")),
        ));
    }

    if !errors.is_empty() {
        return Err(DefinitionError::Invalid(errors));
    }

    // 6. Content folders (warnings).
    if let Some(root) = &opts.spec_root {
        for spec in &specs {
            let folder = root.join(&spec.id);
            if !folder.is_dir() {
                warnings.push(Diagnostic::new(
                    lines.id(&spec.id, 0),
                    format!(
                        "spec '{}' has no content folder at {}; it will be originated from its description",
                        spec.id,
                        folder.display()
                    ),
                ));
            }
        }
    }

    let execution = ExecutionSettings::resolve(raw.execution.as_ref());
    let metadata = raw.metadata.clone().unwrap_or_default();
    let graph = SpecGraph::assemble(metadata, execution, layers, specs);

    Ok(Validated { graph, warnings })
}

fn is_valid_id(id: &str) -> bool {
    id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn render_value(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => format!("'{}'", s),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "?".to_string()),
    }
}

/// Depth-first search over `edges` (node -> nodes it depends on). Each
/// returned cycle starts and ends with the same node, e.g. `[a, b, a]`.
fn find_cycles(edges: &[Vec<usize>]) -> Vec<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Gray,
        Black,
    }

    fn visit(
        node: usize,
        edges: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        cycles: &mut Vec<Vec<usize>>,
        reported: &mut HashSet<Vec<usize>>,
    ) {
        marks[node] = Mark::Gray;
        stack.push(node);
        for &next in &edges[node] {
            match marks[next] {
                Mark::White => visit(next, edges, marks, stack, cycles, reported),
                Mark::Gray => {
                    if let Some(pos) = stack.iter().position(|&n| n == next) {
                        let mut cycle: Vec<usize> = stack[pos..].to_vec();
                        let mut key = cycle.clone();
                        key.sort_unstable();
                        if reported.insert(key) {
                            cycle.push(next);
                            cycles.push(cycle);
                        }
                    }
                }
                Mark::Black => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Black;
    }

    let mut marks = vec![Mark::White; edges.len()];
    let mut stack = Vec::new();
    let mut cycles = Vec::new();
    let mut reported = HashSet::new();
    for node in 0..edges.len() {
        if marks[node] == Mark::White {
            visit(node, edges, &mut marks, &mut stack, &mut cycles, &mut reported);
        }
    }
    cycles
}

/// Maps ids and keys back to 1-based source lines.
struct LineIndex<'a> {
    source: &'a str,
}

impl<'a> LineIndex<'a> {
    fn new(source: &'a str) -> Self {
        Self { source }
    }

    /// Line of the `occurrence`-th (0-based) `id: <id>` entry.
    fn id(&self, id: &str, occurrence: usize) -> Option<usize> {
        let pattern = format!(r#"^\s*-?\s*id:\s*['"]?{}['"]?\s*(#.*)?$"#, regex::escape(id));
        let re = Regex::new(&pattern).ok()?;
        self.source
            .lines()
            .enumerate()
            .filter(|(_, line)| re.is_match(line))
            .nth(occurrence)
            .map(|(i, _)| i + 1)
    }

    /// Line of a top-level key.
    fn key(&self, key: &str) -> Option<usize> {
        let prefix = format!("{}:", key);
        self.source
            .lines()
            .position(|line| line.starts_with(&prefix))
            .map(|i| i + 1)
    }
}
