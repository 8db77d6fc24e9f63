//! Extract-Out: moves the app's outputs into the dataset's derivatives and
//! reads each declared output back.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{StageError, StoreError};
use crate::fields::OutputField;
use crate::store::{derivative_key, BidsDataset, FileSet, RowAddress};
use crate::utils::copy_tree;

use super::completion::{CompletionGate, CompletionSignal};

/// Resolved output values of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedOutputs {
    /// Exactly one output was declared.
    Single(String, FileSet),
    /// Zero or several outputs, in declaration order.
    Tuple(Vec<(String, FileSet)>),
}

impl ExtractedOutputs {
    pub(crate) fn from_named(mut named: Vec<(String, FileSet)>) -> Self {
        if named.len() == 1 {
            if let Some((name, value)) = named.pop() {
                return ExtractedOutputs::Single(name, value);
            }
        }
        ExtractedOutputs::Tuple(named)
    }

    pub fn len(&self) -> usize {
        match self {
            ExtractedOutputs::Single(..) => 1,
            ExtractedOutputs::Tuple(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up an output by name.
    pub fn get(&self, name: &str) -> Option<&FileSet> {
        match self {
            ExtractedOutputs::Single(n, value) => (n == name).then_some(value),
            ExtractedOutputs::Tuple(values) => {
                values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
        }
    }

    /// Flattens into `(name, value)` pairs in declaration order.
    pub fn into_named(self) -> Vec<(String, FileSet)> {
        match self {
            ExtractedOutputs::Single(name, value) => vec![(name, value)],
            ExtractedOutputs::Tuple(values) => values,
        }
    }
}

/// Harvests an app's outputs for one row.
#[derive(Debug, Clone)]
pub struct Extractor {
    app_name: String,
    outputs: Vec<OutputField>,
}

impl Extractor {
    pub fn new(app_name: impl Into<String>, outputs: Vec<OutputField>) -> Self {
        Self {
            app_name: app_name.into(),
            outputs,
        }
    }

    /// Where the output tree for `row` is copied to.
    pub fn destination(&self, dataset: &BidsDataset, row: &RowAddress) -> PathBuf {
        dataset.row_derivatives_dir(&self.app_name, row)
    }

    /// Waits for `after`, copies `output_dir` into the row's derivatives
    /// directory and reads every declared output. Fires `done` on success.
    ///
    /// # Errors
    ///
    /// Fails with `StoreError::DestinationExists` if the row already has
    /// derivatives for this app; nothing is overwritten.
    pub async fn extract(
        &self,
        dataset: &BidsDataset,
        output_dir: &Path,
        row: &RowAddress,
        after: CompletionGate,
        done: CompletionSignal,
    ) -> Result<ExtractedOutputs, StageError> {
        after.wait().await?;

        let destination = self.destination(dataset, row);
        if destination.exists() {
            return Err(StoreError::DestinationExists(destination).into());
        }
        dataset.ensure_derivatives_description(&self.app_name)?;
        // Claims the destination; a concurrent extract of the same row loses here.
        match std::fs::create_dir(&destination) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::DestinationExists(destination).into());
            }
            Err(e) => return Err(StoreError::Io(e).into()),
        }

        let src = output_dir.to_path_buf();
        let dst = destination.clone();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        debug!(
            "Copied {} to {}",
            output_dir.display(),
            destination.display()
        );

        for output in &self.outputs {
            dataset.add_sink(&output.name, output.datatype, output.sink_path(&self.app_name))?;
        }

        let mut named = Vec::with_capacity(self.outputs.len());
        {
            let connection = dataset.connect().await;
            for output in &self.outputs {
                let value = connection
                    .get(row, &derivative_key(&output.name, &self.app_name))
                    .await?;
                debug!("Output '{}' -> {}", output.name, value.primary.display());
                named.push((output.name.clone(), value));
            }
        }

        info!(
            "Extracted {} outputs for {} into {}",
            named.len(),
            row,
            destination.display()
        );
        done.fire();
        Ok(ExtractedOutputs::from_named(named))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::pipeline::completion::completion;
    use crate::pipeline::Stage;

    fn setup() -> (TempDir, BidsDataset, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let dataset = BidsDataset::create(tmp.path().join("ds"), "ds", &["01"]).unwrap();
        let out = tmp.path().join("out");
        fs::create_dir_all(out.join("freesurfer/recon-all/mri")).unwrap();
        fs::write(out.join("freesurfer/recon-all/mri/T1.mgz"), b"mgz").unwrap();
        fs::write(out.join("report.txt"), b"ok").unwrap();
        (tmp, dataset, out)
    }

    fn open_gate() -> CompletionGate {
        CompletionGate::open(Stage::Executing)
    }

    #[tokio::test]
    async fn test_single_output() {
        let (_tmp, dataset, out) = setup();
        let row = RowAddress::session("01").unwrap();
        let extractor = Extractor::new(
            "myapp",
            vec![OutputField::new("recon", "generic/directory", Some("freesurfer/recon-all")).unwrap()],
        );
        let (done, gate) = completion(Stage::Extracting);

        let outputs = extractor
            .extract(&dataset, &out, &row, open_gate(), done)
            .await
            .unwrap();
        gate.wait().await.unwrap();

        let ExtractedOutputs::Single(name, value) = outputs else {
            panic!("expected a single output");
        };
        assert_eq!(name, "recon");
        assert_eq!(
            value.primary,
            dataset
                .root()
                .join("derivatives/myapp/sub-01/freesurfer/recon-all")
        );
        assert!(value.primary.join("mri/T1.mgz").is_file());
        assert!(dataset
            .root()
            .join("derivatives/myapp/dataset_description.json")
            .is_file());
    }

    #[tokio::test]
    async fn test_multiple_outputs_form_tuple() {
        let (_tmp, dataset, out) = setup();
        let row = RowAddress::session("01").unwrap();
        let extractor = Extractor::new(
            "myapp",
            vec![
                OutputField::new("recon", "generic/directory", Some("freesurfer/recon-all")).unwrap(),
                OutputField::new("report", "text/plain", Some("report")).unwrap(),
                OutputField::new("all", "generic/directory", None).unwrap(),
            ],
        );
        let (done, _gate) = completion(Stage::Extracting);
        let outputs = extractor
            .extract(&dataset, &out, &row, open_gate(), done)
            .await
            .unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(
            outputs.get("report").unwrap().primary.file_name().unwrap(),
            "report.txt"
        );
        assert_eq!(
            outputs.get("all").unwrap().primary,
            dataset.root().join("derivatives/myapp/sub-01")
        );
    }

    #[tokio::test]
    async fn test_zero_outputs_is_empty_tuple() {
        let (_tmp, dataset, out) = setup();
        let (done, _gate) = completion(Stage::Extracting);
        let outputs = Extractor::new("myapp", Vec::new())
            .extract(&dataset, &out, &RowAddress::session("01").unwrap(), open_gate(), done)
            .await
            .unwrap();
        assert_eq!(outputs, ExtractedOutputs::Tuple(Vec::new()));
    }

    #[tokio::test]
    async fn test_existing_destination_fails() {
        let (_tmp, dataset, out) = setup();
        let row = RowAddress::session("01").unwrap();
        let extractor = Extractor::new("myapp", Vec::new());
        fs::create_dir_all(extractor.destination(&dataset, &row)).unwrap();

        let (done, gate) = completion(Stage::Extracting);
        let err = extractor
            .extract(&dataset, &out, &row, open_gate(), done)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::Store(StoreError::DestinationExists(_))
        ));
        assert!(gate.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_extracts_of_one_row() {
        let (tmp, dataset, out) = setup();
        let other = tmp.path().join("other");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("other.txt"), b"second").unwrap();
        let row = RowAddress::session("01").unwrap();
        let extractor = Extractor::new("myapp", Vec::new());
        let (first_done, _first) = completion(Stage::Extracting);
        let (second_done, _second) = completion(Stage::Extracting);

        let (first, second) = tokio::join!(
            extractor.extract(&dataset, &out, &row, open_gate(), first_done),
            extractor.extract(&dataset, &other, &row, open_gate(), second_done),
        );

        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(StageError::Store(StoreError::DestinationExists(_)))
        ));
        let destination = extractor.destination(&dataset, &row);
        assert!(destination.join("report.txt").is_file());
        assert!(!destination.join("other.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_output_not_found() {
        let (_tmp, dataset, out) = setup();
        let extractor = Extractor::new(
            "myapp",
            vec![OutputField::new("stats", "text/tsv", Some("stats/aseg")).unwrap()],
        );
        let (done, _gate) = completion(Stage::Extracting);
        let err = extractor
            .extract(&dataset, &out, &RowAddress::session("01").unwrap(), open_gate(), done)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::Store(StoreError::OutputNotFound { ref name, .. }) if name == "stats"
        ));
    }

    #[tokio::test]
    async fn test_closed_gate_skips_copy() {
        let (_tmp, dataset, out) = setup();
        let row = RowAddress::session("01").unwrap();
        let extractor = Extractor::new("myapp", Vec::new());
        let (executed, after) = completion(Stage::Executing);
        drop(executed);
        let (done, _gate) = completion(Stage::Extracting);
        let err = extractor
            .extract(&dataset, &out, &row, after, done)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::UpstreamIncomplete(Stage::Executing)));
        assert!(!extractor.destination(&dataset, &row).exists());
    }
}
