//! Stage-In: writes the run's input values into the BIDS row.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ConfigError, StageError};
use crate::fields::InputField;
use crate::sidecar::SidecarPatchSet;
use crate::store::{BidsDataset, FileSet, RowAddress};

use super::completion::CompletionSignal;
use super::config::MissingInputPolicy;

/// Values supplied for the inputs of one run.
///
/// An input may be left out entirely or explicitly marked absent; both are
/// treated as "no value".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputValues {
    values: BTreeMap<String, Option<PathBuf>>,
}

impl InputValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value for input `name`.
    pub fn set(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.values.insert(name.into(), Some(path.into()));
    }

    /// Builder form of [`InputValues::set`].
    pub fn with(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.set(name, path);
        self
    }

    /// Marks input `name` as explicitly absent.
    pub fn absent(mut self, name: impl Into<String>) -> Self {
        self.values.insert(name.into(), None);
        self
    }

    /// The value for `name`, if one was supplied.
    pub fn get(&self, name: &str) -> Option<&Path> {
        self.values.get(name).and_then(|v| v.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Checks the values against the declared inputs.
    ///
    /// Returns the names of declared inputs without a value. Under
    /// [`MissingInputPolicy::Error`] the first one is an error instead.
    pub fn check(
        &self,
        inputs: &[InputField],
        policy: MissingInputPolicy,
    ) -> Result<Vec<String>, ConfigError> {
        if let Some(unknown) = self
            .values
            .keys()
            .find(|name| !inputs.iter().any(|i| &i.name == *name))
        {
            return Err(ConfigError::UnknownInput(unknown.clone()));
        }
        let missing: Vec<String> = inputs
            .iter()
            .filter(|input| self.get(&input.name).is_none())
            .map(|input| input.name.clone())
            .collect();
        match (policy, missing.first()) {
            (MissingInputPolicy::Error, Some(name)) => Err(ConfigError::MissingInput(name.clone())),
            _ => Ok(missing),
        }
    }
}

/// Result of a successful Stage-In.
#[derive(Debug)]
pub struct StagedInputs {
    /// The dataset the inputs were written to.
    pub dataset: Arc<BidsDataset>,
    /// Where each provided value was stored.
    pub staged: Vec<(String, FileSet)>,
    /// Declared inputs that had no value.
    pub skipped: Vec<String>,
}

/// Stages `values` into `row` of `dataset`.
///
/// Registers one sink per input, then writes every provided value inside a
/// single connection scope carrying `patches`. `done` is fired only after
/// all writes succeed.
pub async fn stage_in(
    dataset: Arc<BidsDataset>,
    row: &RowAddress,
    inputs: &[InputField],
    values: &InputValues,
    patches: SidecarPatchSet,
    policy: MissingInputPolicy,
    done: CompletionSignal,
) -> Result<StagedInputs, StageError> {
    let skipped = values.check(inputs, policy)?;

    for input in inputs {
        dataset.add_sink(&input.name, input.datatype, &input.path)?;
    }

    let mut staged = Vec::with_capacity(inputs.len());
    {
        let connection = dataset.connect().await.with_sidecar_patches(patches);
        for input in inputs {
            let Some(value) = values.get(&input.name) else {
                warn!(
                    "No value provided for input '{}', skipping it for {}",
                    input.name, row
                );
                continue;
            };
            let stored = connection.put(row, &input.name, value).await?;
            debug!(
                "Staged '{}' from {} to {}",
                input.name,
                value.display(),
                stored.primary.display()
            );
            staged.push((input.name.clone(), stored));
        }
    }

    info!(
        "Staged {} of {} inputs for {} in {}",
        staged.len(),
        inputs.len(),
        row,
        dataset.root().display()
    );
    done.fire();
    Ok(StagedInputs {
        dataset,
        staged,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;
    use crate::error::StoreError;
    use crate::pipeline::completion::completion;
    use crate::pipeline::Stage;
    use crate::sidecar::SidecarPatch;

    fn t1w() -> InputField {
        InputField::new("T1w", "medimage/nifti-gz-x", "anat/T1w").unwrap()
    }

    fn dataset(tmp: &TempDir) -> Arc<BidsDataset> {
        Arc::new(BidsDataset::create(tmp.path().join("ds"), "test_dataset", &["01"]).unwrap())
    }

    fn write_t1w(tmp: &TempDir) -> PathBuf {
        let path = tmp.path().join("t1.nii.gz");
        fs::write(&path, b"nifti-bytes").unwrap();
        fs::write(tmp.path().join("t1.json"), r#"{"RepetitionTime": 2.3}"#).unwrap();
        path
    }

    #[tokio::test]
    async fn test_stage_in_round_trip() {
        let tmp = TempDir::new().unwrap();
        let dataset = dataset(&tmp);
        let row = RowAddress::session("01").unwrap();
        let values = InputValues::new().with("T1w", write_t1w(&tmp));
        let patches = SidecarPatchSet::new(&[SidecarPatch::new("Site", "A")], "Site B").unwrap();
        let (signal, gate) = completion(Stage::Staging);

        let result = stage_in(
            dataset.clone(),
            &row,
            &[t1w()],
            &values,
            patches,
            MissingInputPolicy::Warn,
            signal,
        )
        .await
        .unwrap();
        gate.wait().await.unwrap();

        let stored = &result.staged[0].1;
        assert_eq!(
            stored.primary,
            dataset.root().join("sub-01/anat/sub-01_T1w.nii.gz")
        );
        assert_eq!(fs::read(&stored.primary).unwrap(), b"nifti-bytes");

        let sidecar: Value =
            serde_json::from_str(&fs::read_to_string(stored.sidecar.as_ref().unwrap()).unwrap())
                .unwrap();
        assert_eq!(sidecar["RepetitionTime"], 2.3);
        assert_eq!(sidecar["Site"], "B");

        let read_back = dataset.connect().await.get(&row, "T1w").await.unwrap();
        assert_eq!(fs::read(read_back.primary).unwrap(), b"nifti-bytes");
    }

    #[tokio::test]
    async fn test_concurrent_rows_keep_their_own_edits() {
        let tmp = TempDir::new().unwrap();
        let dataset = Arc::new(
            BidsDataset::create(tmp.path().join("ds"), "test_dataset", &["01", "02"]).unwrap(),
        );
        let values = InputValues::new().with("T1w", write_t1w(&tmp));
        let row_a = RowAddress::session("01").unwrap();
        let row_b = RowAddress::session("02").unwrap();
        let inputs = [t1w()];
        let (signal_a, _gate_a) = completion(Stage::Staging);
        let (signal_b, _gate_b) = completion(Stage::Staging);

        // Both rows queue on the connection scope before either writes.
        let held = dataset.connect().await;
        let release = async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            drop(held);
        };
        let (a, b, ()) = tokio::join!(
            stage_in(
                dataset.clone(),
                &row_a,
                &inputs,
                &values,
                SidecarPatchSet::new(&[], "Site A").unwrap(),
                MissingInputPolicy::Warn,
                signal_a,
            ),
            stage_in(
                dataset.clone(),
                &row_b,
                &inputs,
                &values,
                SidecarPatchSet::new(&[], "Site B").unwrap(),
                MissingInputPolicy::Warn,
                signal_b,
            ),
            release,
        );

        let site = |staged: &StagedInputs| -> Value {
            let sidecar = staged.staged[0].1.sidecar.as_ref().unwrap();
            let doc: Value = serde_json::from_str(&fs::read_to_string(sidecar).unwrap()).unwrap();
            doc["Site"].clone()
        };
        assert_eq!(site(&a.unwrap()), "A");
        assert_eq!(site(&b.unwrap()), "B");
    }

    #[tokio::test]
    async fn test_absent_input_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let (signal, gate) = completion(Stage::Staging);
        let result = stage_in(
            dataset(&tmp),
            &RowAddress::session("01").unwrap(),
            &[t1w()],
            &InputValues::new().absent("T1w"),
            SidecarPatchSet::empty(),
            MissingInputPolicy::Warn,
            signal,
        )
        .await
        .unwrap();
        assert!(result.staged.is_empty());
        assert_eq!(result.skipped, vec!["T1w".to_string()]);
        assert!(gate.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_absent_input_is_error_under_strict_policy() {
        let tmp = TempDir::new().unwrap();
        let dataset = dataset(&tmp);
        let (signal, gate) = completion(Stage::Staging);
        let err = stage_in(
            dataset.clone(),
            &RowAddress::session("01").unwrap(),
            &[t1w()],
            &InputValues::new(),
            SidecarPatchSet::empty(),
            MissingInputPolicy::Error,
            signal,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StageError::Config(ConfigError::MissingInput(_))));
        assert!(gate.wait().await.is_err());
        assert!(dataset.sink("T1w").is_none());
    }

    #[tokio::test]
    async fn test_missing_file_fails_and_closes_gate() {
        let tmp = TempDir::new().unwrap();
        let (signal, gate) = completion(Stage::Staging);
        let err = stage_in(
            dataset(&tmp),
            &RowAddress::session("01").unwrap(),
            &[t1w()],
            &InputValues::new().with("T1w", tmp.path().join("missing.nii.gz")),
            SidecarPatchSet::empty(),
            MissingInputPolicy::Warn,
            signal,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StageError::Store(StoreError::InputNotFound(_))));
        assert!(matches!(
            gate.wait().await,
            Err(StageError::UpstreamIncomplete(Stage::Staging))
        ));
    }

    #[test]
    fn test_unknown_input_rejected() {
        let err = InputValues::new()
            .with("T2w", "/data/t2.nii.gz")
            .check(&[t1w()], MissingInputPolicy::Warn)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownInput(ref name) if name == "T2w"));
    }
}
