//! Execution layer for wrapped BIDS apps.
//!
//! The app is either run directly on the host or through a container
//! runtime CLI. The difference is confined to [`ExecutionEnvironment`]:
//! its `plan` method resolves the paths the app sees and the bind mounts it
//! needs, and the resulting [`InvocationPlan`] wraps the app arguments into
//! the command that an [`ExecutionBackend`] runs.
//!
//! # Example
//!
//! ```ignore
//! use bids_app_wrapper::execution::{ContainerRuntime, ExecutionEnvironment, ProcessBackend};
//!
//! let env = ExecutionEnvironment::containerized("nipreps/fmriprep:23.2.0", ContainerRuntime::Docker);
//! let plan = env.plan(&dataset_root, &output_dir, &work_dir);
//! let invocation = plan.command("", app_args)?;
//! let output = ProcessBackend::new().execute(&invocation).await?;
//! ```

pub mod backend;
pub mod environment;

pub use backend::{ExecOutput, ExecutionBackend, ProcessBackend};
pub use environment::{
    AccessMode, Binding, ContainerRuntime, ExecutionEnvironment, Invocation, InvocationPlan,
    PlanTarget, CONTAINER_DATASET_PATH, CONTAINER_DERIV_PATH, CONTAINER_WORK_PATH,
};
