//! Error types for BIDS app wrapper operations.
//!
//! Errors are split by the point at which they can occur:
//! - Configuration problems, detected before anything touches the disk
//! - Dataset store failures while staging inputs or harvesting outputs
//! - Failures launching or running the wrapped app
//! - Pipeline-level errors that name the stage a failure came from

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::Stage;

/// Errors detected while validating a pipeline configuration.
///
/// All of these are raised before any side effect on the dataset or the
/// filesystem takes place.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Duplicate {list} field name '{name}'")]
    DuplicateField { list: &'static str, name: String },

    #[error("Invalid field name '{0}': must start with a letter or underscore and contain only alphanumerics and underscores")]
    InvalidFieldName(String),

    #[error("Invalid datatype '{value}': {reason}")]
    InvalidDatatype { value: String, reason: String },

    #[error("Sidecar edits must be key/value pairs, got {count} tokens")]
    OddEditTokens { count: usize },

    #[error("Invalid sidecar key path '{0}'")]
    InvalidKeyPath(String),

    #[error("Unbalanced quote in '{0}'")]
    UnbalancedQuote(String),

    #[error("Invalid row id '{0}': BIDS labels may only contain alphanumeric characters")]
    InvalidRowId(String),

    #[error("Invalid row frequency '{0}': expected one of session, subject, group, dataset")]
    InvalidFrequency(String),

    #[error("Invalid parameter name '{0}'")]
    InvalidParameterName(String),

    #[error("Parameter '{0}' is declared more than once")]
    DuplicateParameter(String),

    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("Parameter '{name}' expects a {expected} value, got '{value}'")]
    ParameterType {
        name: String,
        expected: String,
        value: String,
    },

    #[error("Unknown input '{0}'")]
    UnknownInput(String),

    #[error("No value provided for required input '{0}'")]
    MissingInput(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the BIDS dataset store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("'{0}' is not a BIDS dataset (missing dataset_description.json)")]
    NotADataset(PathBuf),

    #[error("Sink '{name}' is already registered with a different definition")]
    SinkConflict { name: String },

    #[error("No sink registered for '{0}'")]
    UnknownSink(String),

    #[error("Input value '{0}' does not exist")]
    InputNotFound(PathBuf),

    #[error("'{path}' is not a valid {datatype}: {reason}")]
    Format {
        path: PathBuf,
        datatype: String,
        reason: String,
    },

    #[error("Failed to apply sidecar edit '{key_path}': {reason}")]
    SidecarPatch { key_path: String, reason: String },

    #[error("Derivatives destination '{0}' already exists")]
    DestinationExists(PathBuf),

    #[error("Output '{name}' not found at '{path}'")]
    OutputNotFound { name: String, path: PathBuf },

    #[error("Failed to copy '{src}': {reason}")]
    Copy { src: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while running the wrapped app.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("App exited with non-zero code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("App was terminated by a signal: {stderr}")]
    Terminated { stderr: String },

    #[error("App timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Upstream stage '{0}' did not complete")]
    UpstreamIncomplete(Stage),
}

/// Errors surfaced to the caller of the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The configuration was rejected before anything ran.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A stage failed; later stages were not entered.
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },

    /// Setting up run directories or the dataset failed.
    #[error("Initialization failed: {0}")]
    Initialization(#[from] StoreError),
}

impl PipelineError {
    /// Returns the stage the failure originated in, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
