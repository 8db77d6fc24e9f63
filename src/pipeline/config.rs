//! Pipeline configuration.
//!
//! A [`PipelineConfig`] describes one wrapped app: its name, the inputs it
//! consumes, the outputs it produces, how it is launched, and the dynamic
//! parameters it accepts. Configurations are usually loaded from a YAML or
//! JSON file and may be overridden from the environment. [`PipelineConfig::validate`]
//! turns a configuration into the immutable [`AppDefinition`] the pipeline
//! runs from.

use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::execution::{Binding, ContainerRuntime, ExecutionEnvironment};
use crate::fields::{validate_fields, InputField, OutputField, ParameterSchema, ParameterSpec};
use crate::sidecar::{SidecarPatch, SidecarPatchSet};
use crate::store::Frequency;

/// What to do when a declared input has no value for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingInputPolicy {
    /// Skip the input and log a warning.
    #[default]
    Warn,
    /// Fail the run before anything is written.
    Error,
}

impl FromStr for MissingInputPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "warn" | "skip" => Ok(MissingInputPolicy::Warn),
            "error" | "strict" => Ok(MissingInputPolicy::Error),
            _ => Err(ConfigError::InvalidValue {
                key: "missing_inputs".to_string(),
                message: format!("expected 'warn' or 'error', got '{}'", s),
            }),
        }
    }
}

/// Configuration of a wrapped BIDS app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// App name; also the name of its derivatives directory.
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<InputField>,
    #[serde(default)]
    pub outputs: Vec<OutputField>,

    // Launch settings
    /// Command to run. Inside a container an empty executable means the
    /// image's entrypoint.
    #[serde(default)]
    pub executable: String,
    /// Container image. When set the app runs containerized.
    #[serde(default)]
    pub container_image: Option<String>,
    #[serde(default)]
    pub container_runtime: ContainerRuntime,
    /// Extra bind mounts for containerized runs.
    #[serde(default)]
    pub bindings: Vec<Binding>,
    /// Kill the app after this many seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    // Run settings
    /// Dynamic parameters, rendered as `--<name> <value>` in this order.
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Frequency of the rows the app is run on.
    #[serde(default)]
    pub row_frequency: Frequency,
    /// Sidecar edits applied before any user-supplied edits.
    #[serde(default)]
    pub json_edits: Vec<SidecarPatch>,
    #[serde(default)]
    pub missing_inputs: MissingInputPolicy,
}

impl PipelineConfig {
    /// Creates an empty configuration for the app `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Loads a configuration file. `.json` files are read as JSON,
    /// everything else as YAML.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(serde_yaml::from_str(&content)?)
        }
    }

    /// Applies overrides from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `BIDS_APP_IMAGE`: Container image (empty string forces a native run)
    /// - `BIDS_APP_EXECUTABLE`: Command to run
    /// - `BIDS_APP_CONTAINER_RUNTIME`: `docker` or `singularity`
    /// - `BIDS_APP_TIMEOUT_SECS`: App timeout in seconds
    /// - `BIDS_APP_MISSING_INPUTS`: `warn` or `error`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up through `lookup`.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("BIDS_APP_IMAGE") {
            self.container_image = Some(val).filter(|v| !v.trim().is_empty());
        }

        if let Some(val) = lookup("BIDS_APP_EXECUTABLE") {
            self.executable = val;
        }

        if let Some(val) = lookup("BIDS_APP_CONTAINER_RUNTIME") {
            self.container_runtime = parse_env_value(&val, "BIDS_APP_CONTAINER_RUNTIME")?;
        }

        if let Some(val) = lookup("BIDS_APP_TIMEOUT_SECS") {
            self.timeout_secs = Some(parse_env_value(&val, "BIDS_APP_TIMEOUT_SECS")?);
        }

        if let Some(val) = lookup("BIDS_APP_MISSING_INPUTS") {
            self.missing_inputs = parse_env_value(&val, "BIDS_APP_MISSING_INPUTS")?;
        }

        Ok(self)
    }

    /// Validates the configuration and freezes it.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found. Nothing is written to disk.
    pub fn validate(&self) -> Result<AppDefinition, ConfigError> {
        if !app_name_pattern().is_match(&self.name) {
            return Err(ConfigError::InvalidValue {
                key: "name".to_string(),
                message: format!(
                    "'{}' must start with an alphanumeric and contain only alphanumerics, '.', '_' or '-'",
                    self.name
                ),
            });
        }

        validate_fields(&self.inputs, &self.outputs)?;

        let schema = self
            .parameters
            .iter()
            .cloned()
            .fold(ParameterSchema::builder(), |builder, spec| builder.spec(spec))
            .build()?;

        // Checks the fixed key paths.
        SidecarPatchSet::new(&self.json_edits, "")?;

        let mut environment =
            ExecutionEnvironment::select(self.container_image.as_deref(), self.container_runtime);
        if environment.is_containerized() {
            for binding in &self.bindings {
                environment = environment.with_binding(binding.clone());
            }
        } else if self.executable.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "executable".to_string(),
                message: "required when no container image is configured".to_string(),
            });
        }

        if self.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "timeout_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(AppDefinition {
            name: self.name.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            executable: self.executable.trim().to_string(),
            environment,
            schema,
            frequency: self.row_frequency,
            fixed_edits: self.json_edits.clone(),
            missing_inputs: self.missing_inputs,
            timeout: self.timeout_secs.map(Duration::from_secs),
        })
    }

    /// Builder method to add an input.
    pub fn with_input(mut self, input: InputField) -> Self {
        self.inputs.push(input);
        self
    }

    /// Builder method to add an output.
    pub fn with_output(mut self, output: OutputField) -> Self {
        self.outputs.push(output);
        self
    }

    /// Builder method to set the executable.
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Builder method to set the container image.
    pub fn with_container_image(mut self, image: impl Into<String>) -> Self {
        self.container_image = Some(image.into());
        self
    }

    /// Builder method to set the container runtime.
    pub fn with_container_runtime(mut self, runtime: ContainerRuntime) -> Self {
        self.container_runtime = runtime;
        self
    }

    /// Builder method to add an extra container binding.
    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Builder method to declare a dynamic parameter.
    pub fn with_parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    /// Builder method to set the row frequency.
    pub fn with_row_frequency(mut self, frequency: Frequency) -> Self {
        self.row_frequency = frequency;
        self
    }

    /// Builder method to add a fixed sidecar edit.
    pub fn with_json_edit(mut self, key_path: impl Into<String>, value: impl Into<String>) -> Self {
        self.json_edits.push(SidecarPatch::new(key_path, value));
        self
    }

    /// Builder method to set the missing input policy.
    pub fn with_missing_inputs(mut self, policy: MissingInputPolicy) -> Self {
        self.missing_inputs = policy;
        self
    }

    /// Builder method to set the app timeout, rounded up to whole seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let partial = u64::from(timeout.subsec_nanos() > 0);
        self.timeout_secs = Some(timeout.as_secs().saturating_add(partial));
        self
    }
}

/// A validated, immutable app definition.
#[derive(Debug, Clone)]
pub struct AppDefinition {
    pub name: String,
    pub inputs: Vec<InputField>,
    pub outputs: Vec<OutputField>,
    pub executable: String,
    pub environment: ExecutionEnvironment,
    pub schema: ParameterSchema,
    pub frequency: Frequency,
    pub fixed_edits: Vec<SidecarPatch>,
    pub missing_inputs: MissingInputPolicy,
    pub timeout: Option<Duration>,
}

fn app_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("app name pattern is valid")
    })
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use crate::fields::ParamKind;

    fn native_config() -> PipelineConfig {
        PipelineConfig::new("myapp")
            .with_input(InputField::new("T1w", "medimage/nifti-gz", "anat/T1w").unwrap())
            .with_output(
                OutputField::new("recon", "generic/directory", Some("freesurfer/recon-all"))
                    .unwrap(),
            )
            .with_executable("/opt/myapp/run.sh")
    }

    #[test]
    fn test_valid_config() {
        let app = native_config().validate().unwrap();
        assert_eq!(app.name, "myapp");
        assert_eq!(app.environment, ExecutionEnvironment::Native);
        assert_eq!(app.frequency, Frequency::Session);
        assert_eq!(app.missing_inputs, MissingInputPolicy::Warn);
    }

    #[test]
    fn test_native_requires_executable() {
        let err = PipelineConfig::new("myapp").validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "executable"));

        let app = PipelineConfig::new("myapp")
            .with_container_image("nipreps/fmriprep:23.2.0")
            .validate()
            .unwrap();
        assert!(app.environment.is_containerized());
    }

    #[test]
    fn test_invalid_app_name() {
        for name in ["", "../escape", "my app", "@app"] {
            let config = PipelineConfig {
                name: name.to_string(),
                ..native_config()
            };
            assert!(config.validate().is_err(), "accepted {:?}", name);
        }
    }

    #[test]
    fn test_duplicate_inputs_rejected() {
        let config = native_config()
            .with_input(InputField::new("T1w", "medimage/nifti", "anat/T1w").unwrap());
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::DuplicateField { list: "input", .. }
        ));
    }

    #[test]
    fn test_duplicate_parameters_rejected() {
        let config = native_config()
            .with_parameter(ParameterSpec::new("nthreads", ParamKind::Int))
            .with_parameter(ParameterSpec::new("nthreads", ParamKind::Int));
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::DuplicateParameter(_)
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = native_config().with_timeout(Duration::from_secs(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sub_second_timeout_rounds_up() {
        let config = native_config().with_timeout(Duration::from_millis(500));
        assert_eq!(config.timeout_secs, Some(1));
        assert_eq!(config.validate().unwrap().timeout, Some(Duration::from_secs(1)));

        let config = native_config().with_timeout(Duration::from_millis(2500));
        assert_eq!(config.timeout_secs, Some(3));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BIDS_APP_IMAGE", "bids/freesurfer:7"),
            ("BIDS_APP_CONTAINER_RUNTIME", "apptainer"),
            ("BIDS_APP_TIMEOUT_SECS", "3600"),
            ("BIDS_APP_MISSING_INPUTS", "error"),
        ]
        .into_iter()
        .collect();
        let config = native_config()
            .apply_env_with(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.container_image.as_deref(), Some("bids/freesurfer:7"));
        assert_eq!(config.container_runtime, ContainerRuntime::Singularity);
        assert_eq!(config.timeout_secs, Some(3600));
        assert_eq!(config.missing_inputs, MissingInputPolicy::Error);
    }

    #[test]
    fn test_env_invalid_value() {
        let err = native_config()
            .apply_env_with(|key| (key == "BIDS_APP_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "BIDS_APP_TIMEOUT_SECS"
        ));
    }

    #[test]
    fn test_empty_image_env_forces_native() {
        let config = native_config()
            .with_container_image("bids/freesurfer:7")
            .apply_env_with(|key| (key == "BIDS_APP_IMAGE").then(String::new))
            .unwrap();
        assert_eq!(config.container_image, None);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
name: freesurfer
container_image: bids/freesurfer:7
inputs:
  - name: T1w
    datatype: medimage/nifti-gz-x
    path: anat/T1w
outputs:
  - name: recon
    datatype: generic/directory
    path: freesurfer/recon-all
parameters:
  - name: n_cpus
    kind: int
json_edits:
  - key_path: /Manufacturer
    value: Siemens
missing_inputs: error
"#
        )
        .unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "freesurfer");
        assert_eq!(config.inputs.len(), 1);
        assert_eq!(config.parameters[0].kind, ParamKind::Int);
        assert_eq!(config.json_edits[0].key_path, "/Manufacturer");
        assert_eq!(config.missing_inputs, MissingInputPolicy::Error);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"name": "myapp", "executable": "run.sh", "row_frequency": "group"}}"#
        )
        .unwrap();
        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.row_frequency, Frequency::Group);
    }
}
