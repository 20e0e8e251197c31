//! Validated layer/spec dependency graph.
//!
//! Built only by the validator, so every reference in here resolves and the
//! effective dependency relation is acyclic.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::model::{ExecutionSettings, Metadata};

/// Index into the spec list.
pub type SpecIndex = usize;

/// A layer: an ordered barrier group of specs.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub id: String,
    pub name: Option<String>,
    pub depends_on: Vec<String>,
    /// Spec ids in declaration order.
    pub specs: Vec<String>,
    /// Position in the ordered layer list.
    pub index: usize,
}

/// A single schedulable spec.
#[derive(Debug, Clone, PartialEq)]
pub struct Spec {
    pub id: String,
    pub description: String,
    pub depends_on: Vec<String>,
    pub timeout_minutes: Option<u64>,
    pub layer: String,
    pub layer_index: usize,
}

/// The validated graph of layers and specs.
#[derive(Debug, Clone)]
pub struct SpecGraph {
    metadata: Metadata,
    execution: ExecutionSettings,
    layers: Vec<Layer>,
    specs: Vec<Spec>,
    index_map: HashMap<String, SpecIndex>,
    layer_map: HashMap<String, usize>,
    /// Effective dependencies: declared spec deps plus every spec of every
    /// layer the spec's layer depends on.
    effective: Vec<Vec<SpecIndex>>,
}

impl SpecGraph {
    /// Assemble a graph from already-validated parts.
    pub(crate) fn assemble(
        metadata: Metadata,
        execution: ExecutionSettings,
        layers: Vec<Layer>,
        specs: Vec<Spec>,
    ) -> Self {
        let index_map: HashMap<String, SpecIndex> = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        let layer_map: HashMap<String, usize> = layers
            .iter()
            .enumerate()
            .map(|(i, l)| (l.id.clone(), i))
            .collect();

        let mut effective: Vec<Vec<SpecIndex>> = vec![Vec::new(); specs.len()];

        for (to_idx, spec) in specs.iter().enumerate() {
            let mut deps: BTreeSet<SpecIndex> = spec
                .depends_on
                .iter()
                .filter_map(|d| index_map.get(d).copied())
                .collect();

            let layer = &layers[spec.layer_index];
            for dep_layer in &layer.depends_on {
                if let Some(&li) = layer_map.get(dep_layer) {
                    deps.extend(layers[li].specs.iter().filter_map(|s| index_map.get(s).copied()));
                }
            }
            deps.remove(&to_idx);

            effective[to_idx] = deps.into_iter().collect();
        }

        Self {
            metadata,
            execution,
            layers,
            specs,
            index_map,
            layer_map,
            effective,
        }
    }

    pub fn execution(&self) -> &ExecutionSettings {
        &self.execution
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn specs(&self) -> &[Spec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn spec(&self, id: &str) -> Option<&Spec> {
        self.index_map.get(id).map(|&i| &self.specs[i])
    }

    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layer_map.get(id).map(|&i| &self.layers[i])
    }

    pub fn layer_index(&self, id: &str) -> Option<usize> {
        self.layer_map.get(id).copied()
    }

    /// The layer a spec belongs to.
    pub fn layer_of(&self, spec_id: &str) -> Option<&Layer> {
        self.spec(spec_id).map(|s| &self.layers[s.layer_index])
    }

    /// The layer immediately before `layer_index` in declaration order.
    pub fn previous_layer(&self, layer_index: usize) -> Option<&Layer> {
        layer_index.checked_sub(1).and_then(|i| self.layers.get(i))
    }

    pub fn last_layer(&self) -> Option<&Layer> {
        self.layers.last()
    }

    /// Spec ids of a layer in declaration order.
    pub fn specs_in_layer(&self, layer_id: &str) -> &[String] {
        self.layer(layer_id).map_or(&[], |l| l.specs.as_slice())
    }

    /// Effective dependencies of a spec, sorted by declaration order.
    pub fn effective_dependencies(&self, spec_id: &str) -> Vec<&str> {
        self.index_map
            .get(spec_id)
            .map(|&i| {
                self.effective[i]
                    .iter()
                    .map(|&d| self.specs[d].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Branch namespace for this run: explicit metadata id, else a slug of the
    /// name, else `orchard`.
    pub fn branch_prefix(&self) -> String {
        let raw = self
            .metadata
            .id
            .as_deref()
            .or(self.metadata.name.as_deref())
            .unwrap_or("orchard");
        let slug = slugify(raw);
        if slug.is_empty() {
            "orchard".to_string()
        } else {
            slug
        }
    }

    /// Execution waves for a dry-run plan: layers in order, and within a layer
    /// groups of specs whose in-layer dependencies are satisfied by earlier
    /// groups.
    pub fn waves(&self) -> Vec<(String, Vec<Vec<String>>)> {
        let mut plan = Vec::new();
        let mut done: HashSet<SpecIndex> = HashSet::new();

        for layer in &self.layers {
            let mut remaining: Vec<SpecIndex> = layer
                .specs
                .iter()
                .filter_map(|s| self.index_map.get(s).copied())
                .collect();
            let mut waves = Vec::new();

            while !remaining.is_empty() {
                let (ready, blocked): (Vec<SpecIndex>, Vec<SpecIndex>) = remaining
                    .iter()
                    .partition(|&&i| self.effective[i].iter().all(|d| done.contains(d)));
                if ready.is_empty() {
                    // Unreachable for a validated graph.
                    break;
                }
                waves.push(ready.iter().map(|&i| self.specs[i].id.clone()).collect());
                done.extend(ready);
                remaining = blocked;
            }

            plan.push((layer.id.clone(), waves));
        }

        plan
    }
}

/// Lowercase, dash-separated identifier safe for branch names and paths.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_dash = true;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches(|c| c == '-' || c == '.').to_string()
}
