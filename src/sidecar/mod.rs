//! Ad-hoc edits to JSON sidecars.
//!
//! Edits are `(key path, value)` pairs applied to every JSON sidecar the
//! dataset writes. The effective set is the fixed edits from the pipeline
//! configuration followed by the edits the user passes for a run, so a user
//! edit overrides a fixed edit on the same key path.
//!
//! User edits use a small mini-language: a whitespace separated string of
//! alternating keys and values, e.g. `"TotalReadoutTime 0.05 /Meta/Site ABC"`.
//! Quoting follows [`split_command_line`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ConfigError, StoreError};
use crate::utils::split_command_line;

/// A single sidecar edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarPatch {
    /// JSON pointer to the edited key. A bare key `a` is read as `/a`.
    pub key_path: String,
    /// Replacement value. Parsed as JSON when possible, otherwise a string.
    pub value: String,
}

impl SidecarPatch {
    pub fn new(key_path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key_path: key_path.into(),
            value: value.into(),
        }
    }

    /// The key path as a JSON pointer.
    pub fn pointer(&self) -> String {
        if self.key_path.starts_with('/') {
            self.key_path.clone()
        } else {
            format!("/{}", self.key_path)
        }
    }

    /// The value as JSON: `2` is a number, `true` a bool, `abc` a string.
    pub fn json_value(&self) -> Value {
        serde_json::from_str(&self.value).unwrap_or_else(|_| Value::String(self.value.clone()))
    }

    /// Applies this edit to `doc` in place, creating missing objects.
    pub fn apply(&self, doc: &mut Value) -> Result<(), StoreError> {
        let pointer = self.pointer();
        let fail = |reason: String| StoreError::SidecarPatch {
            key_path: self.key_path.clone(),
            reason,
        };
        let tokens: Vec<String> = pointer.split('/').skip(1).map(decode_token).collect();
        let Some((last, parents)) = tokens.split_last() else {
            return Err(fail("empty key path".to_string()));
        };

        let mut cur = doc;
        for token in parents {
            cur = match cur {
                Value::Object(map) => map.entry(token.clone()).or_insert_with(|| json!({})),
                Value::Array(arr) => {
                    let idx = parse_index(token, arr.len()).map_err(fail)?;
                    &mut arr[idx]
                }
                _ => return Err(fail(format!("'{}' is not an object or array", token))),
            };
        }

        match cur {
            Value::Object(map) => {
                map.insert(last.clone(), self.json_value());
                Ok(())
            }
            Value::Array(arr) => {
                let idx = parse_index(last, arr.len()).map_err(fail)?;
                arr[idx] = self.json_value();
                Ok(())
            }
            _ => Err(fail("target is not an object or array".to_string())),
        }
    }
}

fn decode_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn parse_index(token: &str, len: usize) -> Result<usize, String> {
    let idx: usize = token
        .parse()
        .map_err(|_| format!("'{}' is not a valid array index", token))?;
    if idx >= len {
        return Err(format!("array index {} out of bounds", idx));
    }
    Ok(idx)
}

/// Parses the user edit mini-language into patches.
pub fn parse_edit_string(edits: &str) -> Result<Vec<SidecarPatch>, ConfigError> {
    let tokens = split_command_line(edits)?;
    if tokens.len() % 2 != 0 {
        return Err(ConfigError::OddEditTokens {
            count: tokens.len(),
        });
    }
    tokens
        .chunks(2)
        .map(|pair| {
            let patch = SidecarPatch::new(pair[0].clone(), pair[1].clone());
            check_key_path(&patch)?;
            Ok(patch)
        })
        .collect()
}

fn check_key_path(patch: &SidecarPatch) -> Result<(), ConfigError> {
    let key = patch.key_path.trim();
    if key.is_empty() || key == "/" || key.ends_with('/') {
        return Err(ConfigError::InvalidKeyPath(patch.key_path.clone()));
    }
    Ok(())
}

/// Ordered list of sidecar edits; later entries win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarPatchSet {
    patches: Vec<SidecarPatch>,
}

impl SidecarPatchSet {
    /// Builds the effective set: `fixed` followed by the parsed `user_edits`.
    pub fn new(fixed: &[SidecarPatch], user_edits: &str) -> Result<Self, ConfigError> {
        for patch in fixed {
            check_key_path(patch)?;
        }
        let mut patches = fixed.to_vec();
        patches.extend(parse_edit_string(user_edits)?);
        Ok(Self { patches })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn patches(&self) -> &[SidecarPatch] {
        &self.patches
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Applies every edit in order.
    pub fn apply(&self, doc: &mut Value) -> Result<(), StoreError> {
        if !doc.is_object() && !doc.is_array() {
            *doc = Value::Object(Map::new());
        }
        for patch in &self.patches {
            patch.apply(doc)?;
        }
        Ok(())
    }
}
