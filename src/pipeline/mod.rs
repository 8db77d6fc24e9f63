//! The staging → execute → extract pipeline for a single BIDS row.
//!
//! # Architecture
//!
//! The pipeline consists of three stages, each a separate future:
//!
//! - **Stage-In**: writes the supplied input values into the row's BIDS slots
//! - **Invoker**: runs the app against the dataset, natively or in a container
//! - **Extract-Out**: copies the app's outputs into the dataset's derivatives
//!   and reads each named output back
//!
//! The stages are polled together and ordered only by completion gates: each
//! stage fires a [`CompletionSignal`] when it succeeds, and the next stage
//! waits on the matching [`CompletionGate`] before doing anything. A stage
//! that fails drops its signal, which closes the gate downstream.
//!
//! # Example
//!
//! ```rust,ignore
//! use bids_app_wrapper::pipeline::{BidsAppPipeline, PipelineConfig, RunRequest};
//! use bids_app_wrapper::fields::{InputField, OutputField};
//!
//! let config = PipelineConfig::new("myapp")
//!     .with_input(InputField::new("T1w", "medimage/nifti-gz", "anat/T1w")?)
//!     .with_output(OutputField::new("recon", "generic/directory", Some("freesurfer/recon-all"))?)
//!     .with_executable("/opt/myapp/run.sh");
//!
//! let pipeline = BidsAppPipeline::new(config)?;
//! let outcome = pipeline
//!     .run(RunRequest::new().with_row_id("01").with_input("T1w", "/data/t1.nii.gz"))
//!     .await?;
//!
//! for (name, value) in &outcome.outputs {
//!     println!("{} -> {}", name, value.primary.display());
//! }
//! ```

pub mod completion;
pub mod config;
pub mod extract;
pub mod invoker;
pub mod orchestrator;
pub mod stage_in;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use completion::{completion, CompletionGate, CompletionSignal};
pub use config::{AppDefinition, MissingInputPolicy, PipelineConfig};
pub use extract::{ExtractedOutputs, Extractor};
pub use invoker::{app_arguments, Invoker};
pub use orchestrator::{BidsAppPipeline, DatasetSource, RunOutcome, RunRequest};
pub use stage_in::{stage_in, InputValues, StagedInputs};

/// One of the three pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Staging,
    Executing,
    Extracting,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Staging => "staging",
            Stage::Executing => "executing",
            Stage::Extracting => "extracting",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one pipeline run.
///
/// `Failed` is reachable from every other state. `stage` is `None` when the
/// run failed before staging began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PipelineState {
    Init,
    Staging,
    Executing,
    Extracting,
    Done,
    Failed { stage: Option<Stage> },
}

impl PipelineState {
    /// The state a run is in while `stage` is active.
    pub fn entering(stage: Stage) -> Self {
        match stage {
            Stage::Staging => PipelineState::Staging,
            Stage::Executing => PipelineState::Executing,
            Stage::Extracting => PipelineState::Extracting,
        }
    }

    /// The stage that is active in this state, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Staging => Some(Stage::Staging),
            PipelineState::Executing => Some(Stage::Executing),
            PipelineState::Extracting => Some(Stage::Extracting),
            PipelineState::Failed { stage } => *stage,
            PipelineState::Init | PipelineState::Done => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed { .. })
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Init => write!(f, "INIT"),
            PipelineState::Staging => write!(f, "STAGING"),
            PipelineState::Executing => write!(f, "EXECUTING"),
            PipelineState::Extracting => write!(f, "EXTRACTING"),
            PipelineState::Done => write!(f, "DONE"),
            PipelineState::Failed { stage: Some(stage) } => write!(f, "FAILED({})", stage),
            PipelineState::Failed { stage: None } => write!(f, "FAILED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(PipelineState::Init.to_string(), "INIT");
        assert_eq!(
            PipelineState::Failed {
                stage: Some(Stage::Executing)
            }
            .to_string(),
            "FAILED(executing)"
        );
    }

    #[test]
    fn test_state_stage() {
        assert_eq!(
            PipelineState::entering(Stage::Extracting).stage(),
            Some(Stage::Extracting)
        );
        assert_eq!(PipelineState::Done.stage(), None);
        assert!(PipelineState::Failed { stage: None }.is_terminal());
        assert!(!PipelineState::Staging.is_terminal());
    }
}
