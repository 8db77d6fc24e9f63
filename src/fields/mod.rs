//! Field descriptors for the inputs and outputs of a wrapped BIDS app.
//!
//! An input names a slot inside each BIDS row (`anat/T1w`, `func/bold`, ...)
//! and the datatype it is stored as. An output names a path the app writes
//! inside its derivatives directory (`freesurfer/recon-all`) or, when the
//! path is omitted, the whole directory the app produced for the row.
//!
//! Names must be unique within the input list and, separately, within the
//! output list.

pub mod datatype;
pub mod params;

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use datatype::{Datatype, DatatypeKind};
pub use params::{ParamKind, ParamValue, ParameterSchema, ParameterSchemaBuilder, ParameterSpec};

/// An input to be staged into the BIDS dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputField {
    /// Name the value is supplied under.
    pub name: String,
    /// Format the value is stored in.
    pub datatype: Datatype,
    /// Location within a BIDS row, e.g. `anat/T1w`.
    pub path: String,
}

impl InputField {
    /// Creates an input descriptor, resolving the datatype identifier.
    pub fn new(
        name: impl Into<String>,
        datatype: &str,
        path: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: name.into(),
            datatype: Datatype::parse(datatype)?,
            path: path.into(),
        })
    }
}

/// An output to be read back from the app's derivatives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputField {
    /// Name the resolved value is exposed under.
    pub name: String,
    /// Format of the produced file or directory.
    pub datatype: Datatype,
    /// Location within the app's per-row derivatives directory.
    #[serde(default)]
    pub path: Option<String>,
}

impl OutputField {
    /// Creates an output descriptor, resolving the datatype identifier.
    pub fn new(
        name: impl Into<String>,
        datatype: &str,
        path: Option<&str>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: name.into(),
            datatype: Datatype::parse(datatype)?,
            path: path.map(str::to_string),
        })
    }

    /// Sink path registered on the dataset: `<path or "">@<app-name>`.
    pub fn sink_path(&self, app_name: &str) -> String {
        format!("{}@{}", self.path.as_deref().unwrap_or(""), app_name)
    }
}

fn field_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("field name pattern is valid")
    })
}

/// Returns true if `name` can be used as a field or parameter name.
pub fn is_valid_name(name: &str) -> bool {
    field_name_pattern().is_match(name)
}

/// Rejects invalid or duplicate names within one descriptor list.
pub fn check_unique_names<'a>(
    list: &'static str,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if !is_valid_name(name) {
            return Err(ConfigError::InvalidFieldName(name.to_string()));
        }
        if !seen.insert(name) {
            return Err(ConfigError::DuplicateField {
                list,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Validates input and output descriptor lists independently.
///
/// The same name may appear once as an input and once as an output; the
/// dataset keeps output sinks in their app's namespace.
pub fn validate_fields(inputs: &[InputField], outputs: &[OutputField]) -> Result<(), ConfigError> {
    check_unique_names("input", inputs.iter().map(|f| f.name.as_str()))?;
    check_unique_names("output", outputs.iter().map(|f| f.name.as_str()))?;
    for input in inputs {
        if input.path.trim().is_empty() || input.path.starts_with('/') || input.path.contains('@') {
            return Err(ConfigError::InvalidValue {
                key: format!("inputs.{}.path", input.name),
                message: "must be a relative path within a BIDS row".to_string(),
            });
        }
    }
    for output in outputs {
        if let Some(path) = &output.path {
            if path.starts_with('/') || path.contains('@') {
                return Err(ConfigError::InvalidValue {
                    key: format!("outputs.{}.path", output.name),
                    message: "must be a relative path without '@'".to_string(),
                });
            }
        }
    }
    Ok(())
}
