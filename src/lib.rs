//! bids-app-wrapper: run BIDS apps on single rows of a dataset.
//!
//! A wrapped app is described by a [`PipelineConfig`]: the inputs it reads,
//! the outputs it writes, and how it is launched. [`BidsAppPipeline`] then
//! runs it on one row in three stages: input files are staged into a BIDS
//! dataset, the app is executed against that dataset, and its outputs are
//! copied into the dataset's derivatives and read back.

pub mod cli;
pub mod error;
pub mod execution;
pub mod fields;
pub mod pipeline;
pub mod sidecar;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use error::{ConfigError, ExecutionError, PipelineError, StageError, StoreError};
pub use fields::{Datatype, InputField, OutputField, ParamKind, ParamValue, ParameterSpec};
pub use pipeline::{
    BidsAppPipeline, DatasetSource, PipelineConfig, PipelineState, RunOutcome, RunRequest, Stage,
};
pub use store::{BidsDataset, FileSet, Frequency, RowAddress};
