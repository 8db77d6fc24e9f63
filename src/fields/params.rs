//! Dynamic app parameters.
//!
//! A wrapped app exposes some of its own command-line flags to the user.
//! Those flags are declared up front and frozen into a [`ParameterSchema`];
//! per-run values are checked against the schema and rendered into
//! `--<name>[ <value>]` arguments in declaration order.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

use super::is_valid_name;

/// Value type of a dynamic parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Str,
    Path,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Bool => write!(f, "bool"),
            ParamKind::Int => write!(f, "int"),
            ParamKind::Float => write!(f, "float"),
            ParamKind::Str => write!(f, "str"),
            ParamKind::Path => write!(f, "path"),
        }
    }
}

/// Declaration of one dynamic parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Flag name without the leading `--`.
    pub name: String,
    /// Value type.
    pub kind: ParamKind,
    /// Help text shown by the CLI.
    #[serde(default)]
    pub help: Option<String>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            help: None,
        }
    }
}

/// A per-run parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Collects parameter declarations before the run starts.
#[derive(Debug, Default)]
pub struct ParameterSchemaBuilder {
    specs: Vec<ParameterSpec>,
}

impl ParameterSchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a parameter.
    pub fn parameter(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.specs.push(ParameterSpec::new(name, kind));
        self
    }

    /// Declares a parameter from an existing spec.
    pub fn spec(mut self, spec: ParameterSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Validates the declarations and freezes them.
    pub fn build(self) -> Result<ParameterSchema, ConfigError> {
        let mut seen = HashSet::new();
        for spec in &self.specs {
            if !is_valid_name(&spec.name) {
                return Err(ConfigError::InvalidParameterName(spec.name.clone()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateParameter(spec.name.clone()));
            }
        }
        Ok(ParameterSchema { specs: self.specs })
    }
}

/// Closed, immutable list of dynamic parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSchema {
    specs: Vec<ParameterSpec>,
}

impl ParameterSchema {
    pub fn builder() -> ParameterSchemaBuilder {
        ParameterSchemaBuilder::new()
    }

    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Parses a raw command-line string into a value of the declared type.
    pub fn coerce(&self, name: &str, raw: &str) -> Result<ParamValue, ConfigError> {
        let spec = self
            .get(name)
            .ok_or_else(|| ConfigError::UnknownParameter(name.to_string()))?;
        let mismatch = || ConfigError::ParameterType {
            name: name.to_string(),
            expected: spec.kind.to_string(),
            value: raw.to_string(),
        };
        match spec.kind {
            ParamKind::Bool => match raw.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" | "" => Ok(ParamValue::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(ParamValue::Bool(false)),
                _ => Err(mismatch()),
            },
            ParamKind::Int => raw.parse().map(ParamValue::Int).map_err(|_| mismatch()),
            ParamKind::Float => raw.parse().map(ParamValue::Float).map_err(|_| mismatch()),
            ParamKind::Str | ParamKind::Path => Ok(ParamValue::Text(raw.to_string())),
        }
    }

    /// Checks that every value names a declared parameter of matching type.
    pub fn check(&self, values: &BTreeMap<String, ParamValue>) -> Result<(), ConfigError> {
        for (name, value) in values {
            let spec = self
                .get(name)
                .ok_or_else(|| ConfigError::UnknownParameter(name.clone()))?;
            let ok = matches!(
                (spec.kind, value),
                (ParamKind::Bool, ParamValue::Bool(_))
                    | (ParamKind::Int, ParamValue::Int(_))
                    | (ParamKind::Float, ParamValue::Float(_) | ParamValue::Int(_))
                    | (ParamKind::Str | ParamKind::Path, ParamValue::Text(_))
            );
            if !ok {
                return Err(ConfigError::ParameterType {
                    name: name.clone(),
                    expected: spec.kind.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Renders the supplied values as app arguments, in declaration order.
    ///
    /// `true` booleans become a bare `--<name>`, `false` booleans are left
    /// out, everything else becomes `--<name> <value>`.
    pub fn to_args(&self, values: &BTreeMap<String, ParamValue>) -> Vec<String> {
        let mut args = Vec::new();
        for spec in &self.specs {
            match values.get(&spec.name) {
                Some(ParamValue::Bool(true)) => args.push(format!("--{}", spec.name)),
                Some(ParamValue::Bool(false)) | None => {}
                Some(value) => {
                    args.push(format!("--{}", spec.name));
                    args.push(value.to_string());
                }
            }
        }
        args
    }
}
