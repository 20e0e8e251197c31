//! Raw, as-written shape of a definition document.
//!
//! Every field the validator must report on is optional here so a missing
//! value becomes a diagnostic instead of a deserializer error.

use serde::{Deserialize, Serialize};

use crate::conflict::ConflictMode;
use crate::staging::MergeCadence;

/// Schema version understood by this build.
pub const SUPPORTED_SCHEMA_VERSION: u64 = 1;

/// Default number of specs executed concurrently in parallel mode.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Default per-spec timeout.
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 60;

/// Default branch the first layer builds on and the final merge targets.
pub const DEFAULT_BASE_BRANCH: &str = "main";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDefinition {
    #[serde(default)]
    pub schema_version: Option<serde_yaml::Value>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub execution: Option<ExecutionDefaults>,
    #[serde(default)]
    pub layers: Option<Vec<RawLayer>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: Option<String>,
    /// Explicit identifier; used as the branch namespace when present.
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDefaults {
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub default_timeout_minutes: Option<u64>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub conflict_mode: Option<ConflictMode>,
    #[serde(default)]
    pub merge_cadence: Option<MergeCadence>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawLayer {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub specs: Option<Vec<RawSpec>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
}

/// Resolved execution settings with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    pub max_parallel: usize,
    pub default_timeout_minutes: u64,
    pub base_branch: String,
    pub conflict_mode: ConflictMode,
    pub merge_cadence: MergeCadence,
}

impl ExecutionSettings {
    pub fn resolve(defaults: Option<&ExecutionDefaults>) -> Self {
        let d = defaults.cloned().unwrap_or_default();
        Self {
            max_parallel: d.max_parallel.unwrap_or(DEFAULT_MAX_PARALLEL).max(1),
            default_timeout_minutes: d.default_timeout_minutes.unwrap_or(DEFAULT_TIMEOUT_MINUTES),
            base_branch: d
                .base_branch
                .filter(|b| !b.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string()),
            conflict_mode: d.conflict_mode.unwrap_or_default(),
            merge_cadence: d.merge_cadence.unwrap_or_default(),
        }
    }
}

/// Interpret a `schema_version` value written as either a number or a string.
pub fn schema_version_number(value: &serde_yaml::Value) -> Option<u64> {
    match value {
        serde_yaml::Value::Number(n) => n.as_u64(),
        serde_yaml::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_settings_defaults() {
        let settings = ExecutionSettings::resolve(None);
        assert_eq!(settings.max_parallel, DEFAULT_MAX_PARALLEL);
        assert_eq!(settings.default_timeout_minutes, 60);
        assert_eq!(settings.base_branch, "main");
        assert_eq!(settings.conflict_mode, ConflictMode::Manual);
        assert_eq!(settings.merge_cadence, MergeCadence::Immediate);
    }

    #[test]
    fn test_execution_settings_clamps_zero_parallelism() {
        let defaults = ExecutionDefaults {
            max_parallel: Some(0),
            base_branch: Some("  ".into()),
            ..Default::default()
        };
        let settings = ExecutionSettings::resolve(Some(&defaults));
        assert_eq!(settings.max_parallel, 1);
        assert_eq!(settings.base_branch, "main");
    }

    #[test]
    fn test_schema_version_number_accepts_strings() {
        assert_eq!(schema_version_number(&serde_yaml::Value::from(1)), Some(1));
        assert_eq!(
            schema_version_number(&serde_yaml::Value::String("2".into())),
            Some(2)
        );
        assert_eq!(
            schema_version_number(&serde_yaml::Value::String("beta".into())),
            None
        );
    }
}
