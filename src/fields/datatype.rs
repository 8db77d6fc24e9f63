//! Format identifiers for staged inputs and harvested outputs.
//!
//! Datatypes are referenced by `<namespace>/<name>` identifiers, e.g.
//! `medimage/nifti-gz-x`. Only the on-disk shape is checked here (file vs
//! directory, extension, JSON sidecar); no conversion between formats is
//! performed.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Whether a datatype is stored as a single file or a directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatatypeKind {
    File,
    Directory,
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct FormatSpec {
    id: &'static str,
    kind: DatatypeKind,
    extension: Option<&'static str>,
    sidecar: Option<&'static str>,
    description: &'static str,
}

const FORMATS: &[FormatSpec] = &[
    FormatSpec {
        id: "generic/file",
        kind: DatatypeKind::File,
        extension: None,
        sidecar: None,
        description: "Any single file, extension preserved",
    },
    FormatSpec {
        id: "generic/directory",
        kind: DatatypeKind::Directory,
        extension: None,
        sidecar: None,
        description: "Any directory tree",
    },
    FormatSpec {
        id: "medimage/nifti",
        kind: DatatypeKind::File,
        extension: Some(".nii"),
        sidecar: None,
        description: "Uncompressed NIfTI image",
    },
    FormatSpec {
        id: "medimage/nifti-gz",
        kind: DatatypeKind::File,
        extension: Some(".nii.gz"),
        sidecar: None,
        description: "Gzipped NIfTI image",
    },
    FormatSpec {
        id: "medimage/nifti-x",
        kind: DatatypeKind::File,
        extension: Some(".nii"),
        sidecar: Some(".json"),
        description: "Uncompressed NIfTI image with JSON sidecar",
    },
    FormatSpec {
        id: "medimage/nifti-gz-x",
        kind: DatatypeKind::File,
        extension: Some(".nii.gz"),
        sidecar: Some(".json"),
        description: "Gzipped NIfTI image with JSON sidecar",
    },
    FormatSpec {
        id: "medimage/bval",
        kind: DatatypeKind::File,
        extension: Some(".bval"),
        sidecar: None,
        description: "Diffusion b-values",
    },
    FormatSpec {
        id: "medimage/bvec",
        kind: DatatypeKind::File,
        extension: Some(".bvec"),
        sidecar: None,
        description: "Diffusion gradient directions",
    },
    FormatSpec {
        id: "application/json",
        kind: DatatypeKind::File,
        extension: Some(".json"),
        sidecar: None,
        description: "JSON document",
    },
    FormatSpec {
        id: "text/plain",
        kind: DatatypeKind::File,
        extension: Some(".txt"),
        sidecar: None,
        description: "Plain text file",
    },
    FormatSpec {
        id: "text/tsv",
        kind: DatatypeKind::File,
        extension: Some(".tsv"),
        sidecar: None,
        description: "Tab-separated values",
    },
];

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9]*/[a-z0-9][a-z0-9+.-]*$").expect("datatype pattern is valid")
    })
}

/// A resolved format identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Datatype {
    spec: &'static FormatSpec,
}

impl Datatype {
    /// Resolves a `<namespace>/<name>` identifier against the known formats.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let trimmed = value.trim();
        if !identifier_pattern().is_match(trimmed) {
            return Err(ConfigError::InvalidDatatype {
                value: value.to_string(),
                reason: "expected '<namespace>/<name>'".to_string(),
            });
        }
        FORMATS
            .iter()
            .find(|spec| spec.id == trimmed)
            .map(|spec| Self { spec })
            .ok_or_else(|| ConfigError::InvalidDatatype {
                value: value.to_string(),
                reason: "unknown format".to_string(),
            })
    }

    /// Lists every known datatype.
    pub fn all() -> impl Iterator<Item = Datatype> {
        FORMATS.iter().map(|spec| Datatype { spec })
    }

    pub fn id(&self) -> &'static str {
        self.spec.id
    }

    pub fn kind(&self) -> DatatypeKind {
        self.spec.kind
    }

    pub fn description(&self) -> &'static str {
        self.spec.description
    }

    /// Primary file extension, including the leading dot.
    pub fn extension(&self) -> Option<&'static str> {
        self.spec.extension
    }

    /// Extension of the JSON sidecar stored next to the primary file.
    pub fn sidecar_extension(&self) -> Option<&'static str> {
        self.spec.sidecar
    }

    pub fn is_directory(&self) -> bool {
        self.spec.kind == DatatypeKind::Directory
    }

    /// Returns the extension to use when storing `source` as this datatype.
    ///
    /// Formats without a fixed extension keep whatever the source file has.
    pub fn extension_for(&self, source: &Path) -> String {
        match self.spec.extension {
            Some(ext) => ext.to_string(),
            None => split_extension(source).1,
        }
    }

    /// Checks that `path` has the shape this datatype requires.
    pub fn check(&self, path: &Path) -> Result<(), String> {
        match self.spec.kind {
            DatatypeKind::Directory if !path.is_dir() => Err("expected a directory".to_string()),
            DatatypeKind::File if !path.is_file() => Err("expected a file".to_string()),
            DatatypeKind::File => match self.spec.extension {
                Some(ext) if !file_name(path).ends_with(ext) => {
                    Err(format!("expected a '{}' file", ext))
                }
                _ => Ok(()),
            },
            DatatypeKind::Directory => Ok(()),
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec.id)
    }
}

impl FromStr for Datatype {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Datatype {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Datatype> for String {
    fn from(value: Datatype) -> Self {
        value.spec.id.to_string()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Splits a file name into stem and extension, keeping double extensions
/// such as `.nii.gz` together.
pub(crate) fn split_extension(path: &Path) -> (String, String) {
    let name = file_name(path);
    for known in FORMATS.iter().filter_map(|spec| spec.extension) {
        if known.matches('.').count() > 1 && name.ends_with(known) && name.len() > known.len() {
            return (name[..name.len() - known.len()].to_string(), known.to_string());
        }
    }
    match name.find('.') {
        Some(idx) if idx > 0 => (name[..idx].to_string(), name[idx..].to_string()),
        _ => (name, String::new()),
    }
}
