//! Where the app runs: directly on the host or inside a container.
//!
//! Both variants answer one question through [`ExecutionEnvironment::plan`]:
//! which paths the app sees for the dataset, its output directory and its
//! work directory, and which host directories have to be bound to make
//! those paths valid.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Container path the host output directory is bound to.
pub const CONTAINER_DERIV_PATH: &str = "/frametree_bids_outputs";
/// Container path the dataset root is bound to.
pub const CONTAINER_DATASET_PATH: &str = "/frametree_bids_dataset";
/// Container path the work directory is bound to.
pub const CONTAINER_WORK_PATH: &str = "/frametree_bids_work";

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "ro",
            AccessMode::ReadWrite => "rw",
        }
    }
}

/// Host directory made visible inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Host path.
    pub host_path: PathBuf,
    /// Container path.
    pub container_path: PathBuf,
    /// Whether the container may write to the mount.
    pub access: AccessMode,
}

impl Binding {
    /// Creates a read-write binding.
    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            access: AccessMode::ReadWrite,
        }
    }

    /// Creates a read-only binding.
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            access: AccessMode::ReadOnly,
        }
    }

    /// `host:container:mode`, the format both docker `-v` and singularity
    /// `--bind` accept.
    pub fn to_mount_spec(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path.display(),
            self.access.as_str()
        )
    }
}

/// Container engine used for containerized runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Singularity,
}

impl ContainerRuntime {
    pub fn program(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Singularity => "singularity",
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl FromStr for ContainerRuntime {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(ContainerRuntime::Docker),
            "singularity" | "apptainer" => Ok(ContainerRuntime::Singularity),
            _ => Err(ConfigError::InvalidValue {
                key: "container_runtime".to_string(),
                message: format!("unknown container runtime '{}'", s),
            }),
        }
    }
}

/// The environment the app is executed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEnvironment {
    /// Run the executable directly on host paths.
    Native,
    /// Run inside a container image with explicit bindings.
    Containerized {
        image: String,
        runtime: ContainerRuntime,
        bindings: Vec<Binding>,
    },
}

impl ExecutionEnvironment {
    /// Picks `Containerized` when an image is configured, `Native` otherwise.
    pub fn select(image: Option<&str>, runtime: ContainerRuntime) -> Self {
        match image.map(str::trim).filter(|i| !i.is_empty()) {
            Some(image) => Self::containerized(image, runtime),
            None => Self::Native,
        }
    }

    pub fn containerized(image: impl Into<String>, runtime: ContainerRuntime) -> Self {
        Self::Containerized {
            image: image.into(),
            runtime,
            bindings: Vec::new(),
        }
    }

    /// Adds an extra binding. Has no effect on `Native`.
    pub fn with_binding(mut self, binding: Binding) -> Self {
        if let Self::Containerized { bindings, .. } = &mut self {
            bindings.push(binding);
        }
        self
    }

    pub fn is_containerized(&self) -> bool {
        matches!(self, Self::Containerized { .. })
    }

    /// Resolves the paths the app sees and the bindings it needs.
    pub fn plan(&self, dataset_root: &Path, output_dir: &Path, work_dir: &Path) -> InvocationPlan {
        match self {
            Self::Native => InvocationPlan {
                target: PlanTarget::Native,
                dataset_path: path_string(dataset_root),
                output_path: path_string(output_dir),
                work_path: path_string(work_dir),
                bindings: Vec::new(),
            },
            Self::Containerized {
                image,
                runtime,
                bindings,
            } => {
                let mut all = bindings.clone();
                all.push(Binding::read_only(dataset_root, CONTAINER_DATASET_PATH));
                all.push(Binding::read_write(output_dir, CONTAINER_DERIV_PATH));
                all.push(Binding::read_write(work_dir, CONTAINER_WORK_PATH));
                InvocationPlan {
                    target: PlanTarget::Container {
                        image: image.clone(),
                        runtime: *runtime,
                        name: format!("bids-app-{}", Uuid::new_v4()),
                    },
                    dataset_path: CONTAINER_DATASET_PATH.to_string(),
                    output_path: CONTAINER_DERIV_PATH.to_string(),
                    work_path: CONTAINER_WORK_PATH.to_string(),
                    bindings: all,
                }
            }
        }
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Where a planned invocation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanTarget {
    Native,
    Container {
        image: String,
        runtime: ContainerRuntime,
        /// Name given to the container so it can be killed on timeout.
        name: String,
    },
}

/// Paths and bindings resolved for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationPlan {
    pub target: PlanTarget,
    /// Dataset root as seen by the app.
    pub dataset_path: String,
    /// Output directory as seen by the app.
    pub output_path: String,
    /// Work directory as seen by the app.
    pub work_path: String,
    /// Bind mounts, empty for native runs.
    pub bindings: Vec<Binding>,
}

impl InvocationPlan {
    /// Wraps the app arguments into the full command for this target.
    ///
    /// An empty `executable` means the container's entrypoint; it is only
    /// allowed for containerized runs.
    pub fn command(&self, executable: &str, app_args: Vec<String>) -> Result<Invocation, ConfigError> {
        let executable = executable.trim();
        match &self.target {
            PlanTarget::Native => {
                if executable.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: "executable".to_string(),
                        message: "required when no container image is configured".to_string(),
                    });
                }
                Ok(Invocation {
                    program: executable.to_string(),
                    args: app_args.clone(),
                    app_args,
                    container_name: None,
                })
            }
            PlanTarget::Container {
                image,
                runtime,
                name,
            } => {
                let mut args = Vec::new();
                match runtime {
                    ContainerRuntime::Docker => {
                        args.extend(["run".to_string(), "--rm".to_string()]);
                        args.extend(["--name".to_string(), name.clone()]);
                        for binding in &self.bindings {
                            args.push("-v".to_string());
                            args.push(binding.to_mount_spec());
                        }
                        args.push(image.clone());
                    }
                    ContainerRuntime::Singularity => {
                        let verb = if executable.is_empty() { "run" } else { "exec" };
                        args.push(verb.to_string());
                        for binding in &self.bindings {
                            args.push("--bind".to_string());
                            args.push(binding.to_mount_spec());
                        }
                        args.push(image.clone());
                    }
                }
                if !executable.is_empty() {
                    args.push(executable.to_string());
                }
                args.extend(app_args.iter().cloned());
                Ok(Invocation {
                    program: runtime.program().to_string(),
                    args,
                    app_args,
                    container_name: matches!(runtime, ContainerRuntime::Docker)
                        .then(|| name.clone()),
                })
            }
        }
    }
}

/// A fully resolved command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Program to spawn.
    pub program: String,
    /// Arguments to the program.
    pub args: Vec<String>,
    /// The arguments the app itself receives.
    pub app_args: Vec<String>,
    /// Docker container name, used to stop the container when the run times
    /// out or is dropped.
    pub container_name: Option<String>,
}

impl Invocation {
    /// Shell-quoted command line, for logs.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        crate::utils::shell_join(&parts)
    }
}
