//! Pipeline orchestrator.
//!
//! Drives one row through `INIT → STAGING → EXECUTING → EXTRACTING → DONE`.
//! Everything that can be checked without touching the disk is checked
//! before the run leaves `INIT`; after that the three stages run as joined
//! futures ordered by their completion gates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{ConfigError, PipelineError, StageError, StoreError};
use crate::execution::{ExecOutput, ExecutionBackend, Invocation, ProcessBackend};
use crate::fields::ParamValue;
use crate::sidecar::SidecarPatchSet;
use crate::store::{BidsDataset, FileSet, Frequency, RowAddress};

use super::completion::completion;
use super::config::{AppDefinition, PipelineConfig};
use super::extract::{ExtractedOutputs, Extractor};
use super::invoker::Invoker;
use super::stage_in::{stage_in, InputValues};
use super::{PipelineState, Stage};

/// Directory name of datasets created for a run.
pub const DATASET_DIR_NAME: &str = "frametree_bids_dataset";

/// Where the dataset for a run comes from.
#[derive(Debug, Clone, Default)]
pub enum DatasetSource {
    /// Create a new dataset in a fresh temporary directory.
    #[default]
    Temporary,
    /// Open the dataset at this path, creating it if there is none.
    Path(PathBuf),
    /// Use an already open dataset.
    Existing(Arc<BidsDataset>),
}

/// Everything that varies between runs of the same app.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Row id; `None` means the default row.
    pub row_id: Option<String>,
    /// Overrides the configured row frequency.
    pub frequency: Option<Frequency>,
    pub dataset: DatasetSource,
    /// Where the app writes; a temporary directory if `None`.
    pub output_dir: Option<PathBuf>,
    /// Scratch space for the app; a temporary directory if `None`.
    pub work_dir: Option<PathBuf>,
    pub inputs: InputValues,
    pub parameters: BTreeMap<String, ParamValue>,
    /// Extra app flags, split with shell-like quoting.
    pub flags: String,
    /// Sidecar edits applied after the configured ones.
    pub json_edits: String,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the row id.
    pub fn with_row_id(mut self, id: impl Into<String>) -> Self {
        self.row_id = Some(id.into());
        self
    }

    /// Builder method to override the row frequency.
    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = Some(frequency);
        self
    }

    /// Builder method to set the dataset source.
    pub fn with_dataset(mut self, dataset: DatasetSource) -> Self {
        self.dataset = dataset;
        self
    }

    /// Builder method to set the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Builder method to set the work directory.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Builder method to supply an input value.
    pub fn with_input(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.inputs.set(name, path);
        self
    }

    /// Builder method to supply a parameter value.
    pub fn with_parameter(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Builder method to set the extra app flags.
    pub fn with_flags(mut self, flags: impl Into<String>) -> Self {
        self.flags = flags.into();
        self
    }

    /// Builder method to set the user sidecar edits.
    pub fn with_json_edits(mut self, edits: impl Into<String>) -> Self {
        self.json_edits = edits.into();
        self
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub row: RowAddress,
    /// Declared outputs in declaration order.
    pub outputs: Vec<(String, FileSet)>,
    /// The command that was run.
    pub invocation: Invocation,
    pub execution: ExecOutput,
    pub dataset_root: PathBuf,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    /// Looks up an output by name.
    pub fn output(&self, name: &str) -> Option<&FileSet> {
        self.outputs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// The outputs as a single value or a tuple.
    pub fn into_extracted(self) -> ExtractedOutputs {
        ExtractedOutputs::from_named(self.outputs)
    }
}

/// Directories resolved for one run.
struct RunDirs {
    dataset: Arc<BidsDataset>,
    output_dir: PathBuf,
    work_dir: PathBuf,
}

/// Marks the run failed if it is dropped before reaching a terminal state.
struct FailOnDrop {
    state: Arc<watch::Sender<PipelineState>>,
}

impl Drop for FailOnDrop {
    fn drop(&mut self) {
        let current = *self.state.borrow();
        if !current.is_terminal() {
            warn!("Run abandoned while {}", current);
            self.state.send_replace(PipelineState::Failed {
                stage: current.stage(),
            });
        }
    }
}

/// Runs a wrapped BIDS app on one row at a time.
pub struct BidsAppPipeline {
    app: AppDefinition,
    invoker: Invoker,
    extractor: Extractor,
}

impl BidsAppPipeline {
    /// Creates a pipeline that runs the app as a local process.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if the configuration is invalid.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let timeout = config.validate()?.timeout;
        let backend = match timeout {
            Some(limit) => ProcessBackend::new().with_timeout(limit),
            None => ProcessBackend::new(),
        };
        Self::with_backend(config, Arc::new(backend))
    }

    /// Creates a pipeline that runs the app through `backend`.
    pub fn with_backend(
        config: PipelineConfig,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Result<Self, PipelineError> {
        let app = config.validate()?;
        let invoker = Invoker::new(
            app.executable.clone(),
            app.environment.clone(),
            app.schema.clone(),
            backend,
        );
        let extractor = Extractor::new(app.name.clone(), app.outputs.clone());
        info!(
            "Configured app '{}' ({} inputs, {} outputs, {})",
            app.name,
            app.inputs.len(),
            app.outputs.len(),
            if app.environment.is_containerized() {
                "containerized"
            } else {
                "native"
            }
        );
        Ok(Self {
            app,
            invoker,
            extractor,
        })
    }

    pub fn definition(&self) -> &AppDefinition {
        &self.app
    }

    /// Builds the invocation `request` would run, without side effects.
    ///
    /// Paths the run would create are shown as placeholders under the
    /// system temporary directory.
    pub fn plan(&self, request: &RunRequest) -> Result<Invocation, PipelineError> {
        let row = self.row(request)?;
        self.preflight(request)?;
        let tmp = std::env::temp_dir();
        let dataset_root = match &request.dataset {
            DatasetSource::Temporary => tmp.join("<run>").join(DATASET_DIR_NAME),
            DatasetSource::Path(path) => path.clone(),
            DatasetSource::Existing(dataset) => dataset.root().to_path_buf(),
        };
        let output_dir = request
            .output_dir
            .clone()
            .unwrap_or_else(|| tmp.join("<run>").join("output"));
        let work_dir = request
            .work_dir
            .clone()
            .unwrap_or_else(|| tmp.join("<run>").join("work"));
        Ok(self.invoker.prepare(
            &dataset_root,
            &output_dir,
            &work_dir,
            &row,
            &request.flags,
            &request.parameters,
        )?)
    }

    /// Runs the app on the row described by `request`.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, PipelineError> {
        let (state, _) = watch::channel(PipelineState::Init);
        self.run_observed(request, state).await
    }

    /// Like [`BidsAppPipeline::run`], publishing every state change on `state`.
    ///
    /// Dropping the returned future stops the app and leaves the state at
    /// `FAILED` for the stage that was running.
    pub async fn run_observed(
        &self,
        request: RunRequest,
        state: watch::Sender<PipelineState>,
    ) -> Result<RunOutcome, PipelineError> {
        let state = Arc::new(state);
        let _guard = FailOnDrop {
            state: state.clone(),
        };
        state.send_replace(PipelineState::Init);

        let row = self.row(&request).map_err(|e| fail_early(&state, e))?;
        let patches = self
            .preflight(&request)
            .map_err(|e| fail_early(&state, e))?;

        let span = info_span!("bids_app", app = %self.app.name, row = %row);
        self.execute(request, row, patches, &state)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        request: RunRequest,
        row: RowAddress,
        patches: SidecarPatchSet,
        state: &Arc<watch::Sender<PipelineState>>,
    ) -> Result<RunOutcome, PipelineError> {
        let started_at = Utc::now();
        let dirs = self.resolve_dirs(&row, &request).map_err(|e| {
            error!("Run initialization failed: {}", e);
            state.send_replace(PipelineState::Failed { stage: None });
            PipelineError::Initialization(e)
        })?;

        let invocation = self
            .invoker
            .prepare(
                dirs.dataset.root(),
                &dirs.output_dir,
                &dirs.work_dir,
                &row,
                &request.flags,
                &request.parameters,
            )
            .map_err(|e| fail_early(state, e))?;

        let (staged, staged_gate) = completion(Stage::Staging);
        let staged = staged.on_fire(state.clone(), PipelineState::Executing);
        let (executed, executed_gate) = completion(Stage::Executing);
        let executed = executed.on_fire(state.clone(), PipelineState::Extracting);
        let (extracted, _) = completion(Stage::Extracting);
        let extracted = extracted.on_fire(state.clone(), PipelineState::Done);

        let entering = PipelineState::entering(Stage::Staging);
        info!("Entering {}", entering);
        state.send_replace(entering);

        let staging = stage_in(
            dirs.dataset.clone(),
            &row,
            &self.app.inputs,
            &request.inputs,
            patches,
            self.app.missing_inputs,
            staged,
        );
        let executing = self.invoker.invoke(&invocation, staged_gate, executed);
        let extracting = self.extractor.extract(
            &dirs.dataset,
            &dirs.output_dir,
            &row,
            executed_gate,
            extracted,
        );
        let (staging, executing, extracting) = tokio::join!(staging, executing, extracting);

        // The earliest failure is the origin; later stages only saw a
        // closed gate.
        let execution = match (staging, executing) {
            (Err(e), _) => return Err(fail_stage(state, Stage::Staging, e)),
            (Ok(_), Err(e)) => return Err(fail_stage(state, Stage::Executing, e)),
            (Ok(_), Ok(output)) => output,
        };
        let outputs = extracting.map_err(|e| fail_stage(state, Stage::Extracting, e))?;

        let finished_at = Utc::now();
        info!(
            "Run finished in {:.1}s with {} outputs",
            (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
            outputs.len()
        );
        Ok(RunOutcome {
            row,
            outputs: outputs.into_named(),
            invocation,
            execution,
            dataset_root: dirs.dataset.root().to_path_buf(),
            output_dir: dirs.output_dir,
            work_dir: dirs.work_dir,
            started_at,
            finished_at,
        })
    }

    fn row(&self, request: &RunRequest) -> Result<RowAddress, ConfigError> {
        RowAddress::new(
            request.frequency.unwrap_or(self.app.frequency),
            request.row_id.as_deref(),
        )
    }

    /// Checks everything about `request` that needs no disk access.
    fn preflight(&self, request: &RunRequest) -> Result<SidecarPatchSet, ConfigError> {
        request
            .inputs
            .check(&self.app.inputs, self.app.missing_inputs)?;
        self.app.schema.check(&request.parameters)?;
        crate::utils::split_command_line(&request.flags)?;
        SidecarPatchSet::new(&self.app.fixed_edits, &request.json_edits)
    }

    fn resolve_dirs(&self, row: &RowAddress, request: &RunRequest) -> Result<RunDirs, StoreError> {
        let dataset = match &request.dataset {
            DatasetSource::Existing(dataset) => dataset.clone(),
            DatasetSource::Path(path) if path.join("dataset_description.json").is_file() => {
                Arc::new(BidsDataset::open(path)?)
            }
            DatasetSource::Path(path) => Arc::new(self.create_dataset(path, row)?),
            DatasetSource::Temporary => {
                let root = scratch_dir("dataset")?.join(DATASET_DIR_NAME);
                Arc::new(self.create_dataset(&root, row)?)
            }
        };
        let output_dir = prepare_dir(request.output_dir.as_deref(), "output")?;
        let work_dir = prepare_dir(request.work_dir.as_deref(), "work")?;
        info!(
            "Dataset {}, output {}, work {}",
            dataset.root().display(),
            output_dir.display(),
            work_dir.display()
        );
        Ok(RunDirs {
            dataset,
            output_dir,
            work_dir,
        })
    }

    fn create_dataset(&self, root: &Path, row: &RowAddress) -> Result<BidsDataset, StoreError> {
        BidsDataset::create(root, format!("{}_dataset", self.app.name), &[row.label()])
    }
}

/// Creates `dir`, or a fresh directory under the system temp dir.
fn prepare_dir(dir: Option<&Path>, kind: &str) -> Result<PathBuf, StoreError> {
    match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Ok(dir.to_path_buf())
        }
        None => scratch_dir(kind),
    }
}

/// A new directory under the system temp dir. It is not removed afterwards.
fn scratch_dir(kind: &str) -> Result<PathBuf, StoreError> {
    let dir = std::env::temp_dir().join(format!("bids-app-{}-{}", kind, Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn fail_early(state: &watch::Sender<PipelineState>, err: ConfigError) -> PipelineError {
    error!("Run rejected: {}", err);
    state.send_replace(PipelineState::Failed { stage: None });
    PipelineError::Config(err)
}

fn fail_stage(state: &watch::Sender<PipelineState>, stage: Stage, source: StageError) -> PipelineError {
    error!("Stage '{}' failed: {}", stage, source);
    state.send_replace(PipelineState::Failed { stage: Some(stage) });
    PipelineError::Stage { stage, source }
}
