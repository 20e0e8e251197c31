//! Definition documents: parsing, validation and the resulting spec graph.
//!
//! A definition describes an ordered list of layers, each holding specs with
//! optional fine-grained dependencies. Parsing keeps the raw text so
//! diagnostics can point back at source lines.
//!
//! ```no_run
//! use orchard::definition::{Definition, ValidateOptions, validate};
//!
//! # fn example() -> anyhow::Result<()> {
//! let def = Definition::load(std::path::Path::new("plan.yaml"))?;
//! let validated = validate(&def, &ValidateOptions::default())?;
//! for (layer, waves) in validated.graph.waves() {
//!     println!("{layer}: {waves:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod graph;
mod model;
mod validate;

use std::fmt;
use std::path::Path;

pub use graph::{Layer, Spec, SpecGraph, SpecIndex, slugify};
pub use model::{
    DEFAULT_BASE_BRANCH, DEFAULT_MAX_PARALLEL, DEFAULT_TIMEOUT_MINUTES, ExecutionDefaults,
    ExecutionSettings, Metadata, RawDefinition, RawLayer, RawSpec, SUPPORTED_SCHEMA_VERSION,
};
pub use validate::{ValidateOptions, Validated, validate};

use crate::errors::DefinitionError;
use crate::state::split_document;

/// A line-addressable validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// 1-based source line, when the finding can be located.
    pub line: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(line: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A parsed, not yet validated, definition document.
#[derive(Debug, Clone)]
pub struct Definition {
    source: String,
    raw: RawDefinition,
}

impl Definition {
    /// Parse definition text. Any runtime-state section after the state
    /// delimiter is ignored.
    pub fn parse(text: &str) -> Result<Self, DefinitionError> {
        let (definition_text, _) = split_document(text);
        let raw: RawDefinition = if definition_text.trim().is_empty() {
            RawDefinition::default()
        } else {
            serde_yaml::from_str(definition_text).map_err(|e| {
                let location = e.location();
                DefinitionError::Syntax {
                    line: location.as_ref().map(|l| l.line()),
                    column: location.as_ref().map(|l| l.column()),
                    message: e.to_string(),
                }
            })?
        };

        Ok(Self {
            source: definition_text.to_string(),
            raw,
        })
    }

    /// Read and parse a definition file.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let text = std::fs::read_to_string(path).map_err(|source| DefinitionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Definition text exactly as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn raw(&self) -> &RawDefinition {
        &self.raw
    }
}

/// Load, parse and validate a definition file in one step.
pub fn load_definition(path: &Path, opts: &ValidateOptions) -> Result<Validated, DefinitionError> {
    let def = Definition::load(path)?;
    validate(&def, opts)
}
