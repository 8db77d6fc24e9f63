//! Invoker: runs the app against the staged dataset.
//!
//! The app receives the BIDS-Apps positional arguments followed by the user
//! flags, the work directory, and the dynamic parameters:
//!
//! ```text
//! <dataset> <output> <participant|group> [--participant-label <label>]
//!     <flags...> --work-dir <work> [--<param> [<value>]]...
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ConfigError, StageError};
use crate::execution::{ExecOutput, ExecutionBackend, ExecutionEnvironment, Invocation, InvocationPlan};
use crate::fields::{ParamValue, ParameterSchema};
use crate::store::{AnalysisLevel, RowAddress};
use crate::utils::split_command_line;

use super::completion::{CompletionGate, CompletionSignal};

/// Builds the app's argument list for `row` against a resolved plan.
pub fn app_arguments(
    plan: &InvocationPlan,
    row: &RowAddress,
    flags: &[String],
    schema: &ParameterSchema,
    params: &BTreeMap<String, ParamValue>,
) -> Vec<String> {
    let level = row.analysis_level();
    let mut args = vec![
        plan.dataset_path.clone(),
        plan.output_path.clone(),
        level.as_str().to_string(),
    ];
    if level == AnalysisLevel::Participant {
        args.push("--participant-label".to_string());
        args.push(row.label().to_string());
    }
    args.extend(flags.iter().cloned());
    args.push("--work-dir".to_string());
    args.push(plan.work_path.clone());
    args.extend(schema.to_args(params));
    args
}

/// Launches the app once Stage-In has completed.
pub struct Invoker {
    executable: String,
    environment: ExecutionEnvironment,
    schema: ParameterSchema,
    backend: Arc<dyn ExecutionBackend>,
}

impl Invoker {
    pub fn new(
        executable: impl Into<String>,
        environment: ExecutionEnvironment,
        schema: ParameterSchema,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Self {
        Self {
            executable: executable.into(),
            environment,
            schema,
            backend,
        }
    }

    pub fn environment(&self) -> &ExecutionEnvironment {
        &self.environment
    }

    /// Resolves the full command for a run without executing anything.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unknown or ill-typed parameters, unbalanced
    /// quotes in `flags`, or a native run without an executable.
    pub fn prepare(
        &self,
        dataset_root: &Path,
        output_dir: &Path,
        work_dir: &Path,
        row: &RowAddress,
        flags: &str,
        params: &BTreeMap<String, ParamValue>,
    ) -> Result<Invocation, ConfigError> {
        self.schema.check(params)?;
        let flags = split_command_line(flags)?;
        let plan = self.environment.plan(dataset_root, output_dir, work_dir);
        let args = app_arguments(&plan, row, &flags, &self.schema, params);
        plan.command(&self.executable, args)
    }

    /// Waits for `after`, runs `invocation` to completion, then fires `done`.
    pub async fn invoke(
        &self,
        invocation: &Invocation,
        after: CompletionGate,
        done: CompletionSignal,
    ) -> Result<ExecOutput, StageError> {
        after.wait().await?;

        info!("Launching app: {}", invocation.command_line());
        let output = self.backend.execute(invocation).await?;
        debug!("App stdout:\n{}", output.stdout);
        info!("App finished in {:.1}s", output.duration.as_secs_f64());

        done.fire();
        Ok(output)
    }
}
