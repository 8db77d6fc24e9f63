//! Filesystem-backed BIDS dataset.
//!
//! Layout:
//!
//! ```text
//! <root>/dataset_description.json
//! <root>/sub-<label>/<dir>/sub-<label>_<entity><ext>   (+ .json sidecar)
//! <root>/derivatives/<app>/dataset_description.json
//! <root>/derivatives/<app>/sub-<label>/...
//! ```
//!
//! Sinks map a name to a datatype and a path. A plain path such as
//! `anat/T1w` addresses a slot inside the row; `<sub-path>@<app>` addresses
//! the app's derivatives for the row, with an empty sub-path meaning the
//! whole per-row derivatives directory. Derivative sinks are keyed as
//! `<name>@<app>`, so they never collide with a row sink of the same name.
//!
//! Reads and writes go through a [`Connection`], which holds the dataset's
//! connection scope for as long as it is alive. Sidecar edits belong to the
//! connection that writes them, not to the dataset.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::fields::datatype::split_extension;
use crate::fields::Datatype;
use crate::sidecar::SidecarPatchSet;
use crate::utils::copy_tree;

use super::row::RowAddress;

/// BIDS version written into generated dataset descriptions.
pub const BIDS_VERSION: &str = "1.8.0";

const DESCRIPTION_FILE: &str = "dataset_description.json";

/// A named, typed slot registered on the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sink {
    pub name: String,
    pub datatype: Datatype,
    pub path: String,
}

impl Sink {
    /// Splits the path into `(sub-path, app)` for derivative sinks.
    fn derivative(&self) -> Option<(&str, &str)> {
        self.path.rsplit_once('@')
    }

    /// Key the sink is registered under.
    pub fn key(&self) -> String {
        match self.derivative() {
            Some((_, app)) => derivative_key(&self.name, app),
            None => self.name.clone(),
        }
    }
}

/// Registry key of the derivative sink `name` of `app`.
pub fn derivative_key(name: &str, app: &str) -> String {
    format!("{}@{}", name, app)
}

/// Stored location of a single value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet {
    pub datatype: Datatype,
    /// The file, or root directory for directory datatypes.
    pub primary: PathBuf,
    /// JSON sidecar, for datatypes that carry one.
    pub sidecar: Option<PathBuf>,
}

impl FileSet {
    /// Describes a value on disk, picking up a sibling sidecar if present.
    pub fn from_path(datatype: Datatype, primary: impl Into<PathBuf>) -> Self {
        let primary = primary.into();
        let sidecar = datatype
            .sidecar_extension()
            .map(|ext| sibling_with_extension(&primary, ext))
            .filter(|p| p.is_file());
        Self {
            datatype,
            primary,
            sidecar,
        }
    }
}

fn sibling_with_extension(path: &Path, ext: &str) -> PathBuf {
    let (stem, _) = split_extension(path);
    path.with_file_name(format!("{}{}", stem, ext))
}

/// Handle to a BIDS dataset on disk.
#[derive(Debug)]
pub struct BidsDataset {
    root: PathBuf,
    name: String,
    sinks: RwLock<BTreeMap<String, Sink>>,
    connection: Mutex<()>,
}

impl BidsDataset {
    /// Creates a new dataset at `root` with one subject directory per leaf.
    pub fn create(
        root: impl Into<PathBuf>,
        name: impl Into<String>,
        leaves: &[&str],
    ) -> Result<Self, StoreError> {
        let root = root.into();
        let name = name.into();
        let description = root.join(DESCRIPTION_FILE);
        if description.exists() {
            return Err(StoreError::DestinationExists(description));
        }
        fs::create_dir_all(&root)?;
        let content = json!({
            "Name": name,
            "BIDSVersion": BIDS_VERSION,
            "DatasetType": "raw",
            "Authors": [format!("Auto-generated by bids-app-wrapper {}", env!("CARGO_PKG_VERSION"))],
        });
        fs::write(&description, serde_json::to_string_pretty(&content)?)?;
        for leaf in leaves {
            fs::create_dir_all(root.join(format!("sub-{}", leaf)))?;
        }
        info!("Created BIDS dataset '{}' at {}", name, root.display());
        Ok(Self::with_root(root, name))
    }

    /// Opens an existing dataset.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let description = root.join(DESCRIPTION_FILE);
        if !description.is_file() {
            return Err(StoreError::NotADataset(root));
        }
        let content: Value = serde_json::from_str(&fs::read_to_string(&description)?)?;
        let name = content
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self::with_root(root, name))
    }

    fn with_root(root: PathBuf, name: String) -> Self {
        Self {
            root,
            name,
            sinks: RwLock::new(BTreeMap::new()),
            connection: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a sink. Re-registering an identical sink is a no-op.
    pub fn add_sink(
        &self,
        name: impl Into<String>,
        datatype: Datatype,
        path: impl Into<String>,
    ) -> Result<(), StoreError> {
        let sink = Sink {
            name: name.into(),
            datatype,
            path: path.into(),
        };
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        let key = sink.key();
        match sinks.get(&key) {
            Some(existing) if *existing == sink => Ok(()),
            Some(_) => Err(StoreError::SinkConflict { name: sink.name }),
            None => {
                debug!("Registered sink '{}' -> {} ({})", key, sink.path, sink.datatype);
                sinks.insert(key, sink);
                Ok(())
            }
        }
    }

    /// Looks up a sink by key: its name, or `<name>@<app>` for derivatives.
    pub fn sink(&self, key: &str) -> Option<Sink> {
        self.sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Opens the connection scope. It is released when the guard drops.
    pub async fn connect(&self) -> Connection<'_> {
        let guard = self.connection.lock().await;
        Connection {
            dataset: self,
            patches: SidecarPatchSet::empty(),
            _guard: guard,
        }
    }

    /// Directory holding a row's files.
    pub fn row_dir(&self, row: &RowAddress) -> PathBuf {
        if row.frequency().is_participant_level() {
            self.root.join(row.subject_dir())
        } else {
            self.root.clone()
        }
    }

    /// Root of an app's derivatives.
    pub fn derivatives_dir(&self, app_name: &str) -> PathBuf {
        self.root.join("derivatives").join(app_name)
    }

    /// Per-row derivatives directory: `derivatives/<app>/sub-<label>`.
    pub fn row_derivatives_dir(&self, app_name: &str, row: &RowAddress) -> PathBuf {
        self.derivatives_dir(app_name).join(row.subject_dir())
    }

    /// Writes a `dataset_description.json` for the app's derivatives if
    /// there is none yet.
    pub fn ensure_derivatives_description(&self, app_name: &str) -> Result<(), StoreError> {
        let dir = self.derivatives_dir(app_name);
        let description = dir.join(DESCRIPTION_FILE);
        if description.exists() {
            return Ok(());
        }
        fs::create_dir_all(&dir)?;
        let content = json!({
            "Name": format!("{} derivatives", app_name),
            "BIDSVersion": BIDS_VERSION,
            "DatasetType": "derivative",
            "GeneratedBy": [{"Name": app_name}],
        });
        fs::write(&description, serde_json::to_string_pretty(&content)?)?;
        Ok(())
    }

    /// Where a row-level sink's value lives, without extension.
    fn slot_base(&self, row: &RowAddress, sink_path: &str) -> PathBuf {
        let rel = Path::new(sink_path);
        let entity = rel
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let parent = rel.parent().unwrap_or_else(|| Path::new(""));
        let file_name = if row.frequency().is_participant_level() {
            format!("{}_{}", row.subject_dir(), entity)
        } else {
            entity
        };
        self.row_dir(row).join(parent).join(file_name)
    }
}

/// An open connection scope on a [`BidsDataset`].
pub struct Connection<'a> {
    dataset: &'a BidsDataset,
    patches: SidecarPatchSet,
    _guard: MutexGuard<'a, ()>,
}

impl Connection<'_> {
    /// Sets the edits applied to every sidecar this connection writes.
    pub fn with_sidecar_patches(mut self, patches: SidecarPatchSet) -> Self {
        self.patches = patches;
        self
    }

    /// Stores `value` in the row slot registered under `name`.
    pub async fn put(
        &self,
        row: &RowAddress,
        name: &str,
        value: &Path,
    ) -> Result<FileSet, StoreError> {
        let sink = self
            .dataset
            .sink(name)
            .ok_or_else(|| StoreError::UnknownSink(name.to_string()))?;
        if sink.derivative().is_some() {
            return Err(StoreError::Format {
                path: PathBuf::from(&sink.path),
                datatype: sink.datatype.to_string(),
                reason: "derivative sinks are read-only".to_string(),
            });
        }
        if !value.exists() {
            return Err(StoreError::InputNotFound(value.to_path_buf()));
        }
        sink.datatype
            .check(value)
            .map_err(|reason| StoreError::Format {
                path: value.to_path_buf(),
                datatype: sink.datatype.to_string(),
                reason,
            })?;

        let base = self.dataset.slot_base(row, &sink.path);
        let patches = self.patches.clone();
        let source = value.to_path_buf();
        let datatype = sink.datatype;

        let stored = tokio::task::spawn_blocking(move || {
            write_value(datatype, &source, &base, &patches)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        debug!(
            "Stored '{}' for {} at {}",
            name,
            row,
            stored.primary.display()
        );
        Ok(stored)
    }

    /// Resolves the value of the sink registered under `key` for `row`.
    pub async fn get(&self, row: &RowAddress, key: &str) -> Result<FileSet, StoreError> {
        let sink = self
            .dataset
            .sink(key)
            .ok_or_else(|| StoreError::UnknownSink(key.to_string()))?;

        let base = match sink.derivative() {
            Some((sub_path, app)) => {
                let dir = self.dataset.row_derivatives_dir(app, row);
                if sub_path.is_empty() {
                    dir
                } else {
                    dir.join(sub_path)
                }
            }
            None => self.dataset.slot_base(row, &sink.path),
        };
        let path = locate(&base).ok_or_else(|| StoreError::OutputNotFound {
            name: sink.name.clone(),
            path: base.clone(),
        })?;
        sink.datatype
            .check(&path)
            .map_err(|reason| StoreError::Format {
                path: path.clone(),
                datatype: sink.datatype.to_string(),
                reason,
            })?;
        Ok(FileSet::from_path(sink.datatype, path))
    }
}

/// Finds `base` itself, or a file in its directory named `<stem>.<ext>`.
fn locate(base: &Path) -> Option<PathBuf> {
    if base.exists() {
        return Some(base.to_path_buf());
    }
    let dir = base.parent()?;
    let prefix = format!("{}.", base.file_name()?.to_string_lossy());
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(&prefix))
        })
        .collect();
    // Sidecars share the primary file's stem.
    candidates.sort_by_key(|p| (p.extension().is_some_and(|e| e == "json"), p.clone()));
    candidates.into_iter().next()
}

fn write_value(
    datatype: Datatype,
    source: &Path,
    base: &Path,
    patches: &SidecarPatchSet,
) -> Result<FileSet, StoreError> {
    if datatype.is_directory() {
        if base.exists() {
            fs::remove_dir_all(base)?;
        }
        copy_tree(source, base)?;
        return Ok(FileSet::from_path(datatype, base));
    }

    if let Some(parent) = base.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut dest = base.as_os_str().to_os_string();
    dest.push(datatype.extension_for(source));
    let dest = PathBuf::from(dest);
    fs::copy(source, &dest)?;

    if let Some(ext) = datatype.sidecar_extension() {
        let source_sidecar = sibling_with_extension(source, ext);
        let mut doc: Value = if source_sidecar.is_file() {
            serde_json::from_str(&fs::read_to_string(&source_sidecar)?)?
        } else {
            json!({})
        };
        patches.apply(&mut doc)?;
        let mut sidecar = base.as_os_str().to_os_string();
        sidecar.push(ext);
        fs::write(PathBuf::from(sidecar), serde_json::to_string_pretty(&doc)?)?;
    }

    Ok(FileSet::from_path(datatype, dest))
}
