//! CLI command definitions for bids-app-wrapper.
//!
//! `run` stages inputs, runs the app and harvests its outputs for one row;
//! `plan` prints the command `run` would execute; `datatypes` lists the
//! format identifiers that inputs and outputs may use.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::fields::{Datatype, DatatypeKind, ParamValue, ParameterSchema};
use crate::pipeline::{BidsAppPipeline, DatasetSource, PipelineConfig, RunOutcome, RunRequest};
use crate::store::{FileSet, Frequency};

/// Wraps a BIDS app so it can be run on a single input/output row.
#[derive(Parser)]
#[command(name = "bids-app-wrapper")]
#[command(about = "Run a BIDS app on a single row: stage inputs, execute, extract outputs")]
#[command(version)]
#[command(
    long_about = "bids-app-wrapper stages the given input files into a BIDS dataset, runs the configured BIDS app on it (natively or in a container), and reads the declared outputs back from the app's derivatives.\n\nExample usage:\n  bids-app-wrapper run --config fmriprep.yaml --row-id 01 --input T1w=/data/t1.nii.gz --output-dir ./out"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the app on one row and print the resolved outputs.
    Run(RunArgs),

    /// Print the command a run would execute, without running it.
    Plan(RunArgs),

    /// List the known datatype identifiers.
    Datatypes(DatatypesArgs),
}

/// Arguments shared by `run` and `plan`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// App configuration file (YAML, or JSON with a `.json` extension).
    #[arg(short, long, env = "BIDS_APP_CONFIG")]
    pub config: PathBuf,

    /// Row id (subject label). Defaults to DEFAULT.
    #[arg(short, long)]
    pub row_id: Option<String>,

    /// Row frequency: session, subject, group or dataset.
    #[arg(long)]
    pub frequency: Option<Frequency>,

    /// Dataset directory. Opened if it exists, created otherwise.
    #[arg(short, long)]
    pub dataset: Option<PathBuf>,

    /// Directory the app writes its outputs to.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Scratch directory passed as --work-dir.
    #[arg(short, long)]
    pub work_dir: Option<PathBuf>,

    /// Input value, repeatable.
    #[arg(short, long = "input", value_name = "NAME=PATH")]
    pub inputs: Vec<String>,

    /// Parameter value, repeatable.
    #[arg(short, long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Extra flags passed to the app verbatim.
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub flags: String,

    /// Sidecar edits as alternating keys and values.
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub json_edits: String,

    /// Override the container image from the configuration.
    #[arg(long)]
    pub image: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `bids-app-wrapper datatypes`.
#[derive(Parser, Debug)]
pub struct DatatypesArgs {
    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_app_command(args).await,
        Commands::Plan(args) => run_plan_command(args),
        Commands::Datatypes(args) => run_datatypes_command(args),
    }
}

// ============================================================================
// Run / Plan
// ============================================================================

async fn run_app_command(args: RunArgs) -> anyhow::Result<()> {
    let pipeline = build_pipeline(&args)?;
    let request = build_request(&args, &pipeline.definition().schema)?;
    let outcome = pipeline.run(request).await?;

    if args.json {
        let report = RunReport::from(&outcome);
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json);
    } else {
        println!("Row:     {}", outcome.row);
        println!("Dataset: {}", outcome.dataset_root.display());
        for (name, value) in &outcome.outputs {
            println!("  {:<16} {}", name, value.primary.display());
        }
    }
    Ok(())
}

fn run_plan_command(args: RunArgs) -> anyhow::Result<()> {
    let pipeline = build_pipeline(&args)?;
    let request = build_request(&args, &pipeline.definition().schema)?;
    let invocation = pipeline.plan(&request)?;

    if args.json {
        let json = serde_json::to_string_pretty(&invocation)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json);
    } else {
        println!("{}", invocation.command_line());
    }
    Ok(())
}

fn build_pipeline(args: &RunArgs) -> anyhow::Result<BidsAppPipeline> {
    let mut config = PipelineConfig::from_file(&args.config)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", args.config.display(), e))?
        .apply_env()?;
    if let Some(image) = &args.image {
        config.container_image = Some(image.clone());
    }
    info!("Loaded configuration for '{}'", config.name);
    Ok(BidsAppPipeline::new(config)?)
}

fn build_request(args: &RunArgs, schema: &ParameterSchema) -> anyhow::Result<RunRequest> {
    let mut request = RunRequest::new()
        .with_flags(args.flags.clone())
        .with_json_edits(args.json_edits.clone());
    request.row_id = args.row_id.clone();
    request.frequency = args.frequency;
    request.output_dir = args.output_dir.clone();
    request.work_dir = args.work_dir.clone();
    if let Some(dataset) = &args.dataset {
        request.dataset = DatasetSource::Path(dataset.clone());
    }

    for raw in &args.inputs {
        let (name, path) = parse_assignment(raw, "--input")?;
        request.inputs.set(name, path);
    }

    let mut parameters = BTreeMap::new();
    for raw in &args.params {
        let (name, value) = parse_assignment(raw, "--param")?;
        let value: ParamValue = schema.coerce(name, value)?;
        parameters.insert(name.to_string(), value);
    }
    request.parameters = parameters;
    Ok(request)
}

/// Splits `NAME=VALUE`.
fn parse_assignment<'a>(raw: &'a str, flag: &str) -> anyhow::Result<(&'a str, &'a str)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value)),
        _ => anyhow::bail!("{} expects NAME=VALUE, got '{}'", flag, raw),
    }
}

#[derive(Serialize)]
struct RunReport<'a> {
    row: String,
    dataset: &'a std::path::Path,
    output_dir: &'a std::path::Path,
    command: String,
    duration_secs: f64,
    outputs: BTreeMap<&'a str, &'a FileSet>,
}

impl<'a> From<&'a RunOutcome> for RunReport<'a> {
    fn from(outcome: &'a RunOutcome) -> Self {
        Self {
            row: outcome.row.to_string(),
            dataset: &outcome.dataset_root,
            output_dir: &outcome.output_dir,
            command: outcome.invocation.command_line(),
            duration_secs: outcome.execution.duration.as_secs_f64(),
            outputs: outcome
                .outputs
                .iter()
                .map(|(name, value)| (name.as_str(), value))
                .collect(),
        }
    }
}

// ============================================================================
// Datatypes
// ============================================================================

#[derive(Serialize)]
struct DatatypeEntry {
    id: &'static str,
    kind: &'static str,
    extension: Option<&'static str>,
    sidecar: Option<&'static str>,
    description: &'static str,
}

fn datatype_entries() -> Vec<DatatypeEntry> {
    Datatype::all()
        .map(|dt| DatatypeEntry {
            id: dt.id(),
            kind: match dt.kind() {
                DatatypeKind::File => "file",
                DatatypeKind::Directory => "directory",
            },
            extension: dt.extension(),
            sidecar: dt.sidecar_extension(),
            description: dt.description(),
        })
        .collect()
}

fn run_datatypes_command(args: DatatypesArgs) -> anyhow::Result<()> {
    let entries = datatype_entries();
    if args.json {
        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json);
        return Ok(());
    }
    for entry in entries {
        let ext = match (entry.extension, entry.sidecar) {
            (Some(ext), Some(sidecar)) => format!("{} + {}", ext, sidecar),
            (Some(ext), None) => ext.to_string(),
            (None, _) => "-".to_string(),
        };
        println!(
            "{:<22} {:<10} {:<16} {}",
            entry.id, entry.kind, ext, entry.description
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::ParamKind;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_with_all_options() {
        let args = vec![
            "bids-app-wrapper",
            "run",
            "--config",
            "app.yaml",
            "--row-id",
            "01",
            "--frequency",
            "group",
            "-i",
            "T1w=/data/t1.nii.gz",
            "--input",
            "bold=/data/bold.nii.gz",
            "-p",
            "n_cpus=4",
            "--flags",
            "--fs-no-reconall --low-mem",
            "--json-edits",
            "TaskName rest",
            "--json",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, PathBuf::from("app.yaml"));
                assert_eq!(args.row_id.as_deref(), Some("01"));
                assert_eq!(args.frequency, Some(Frequency::Group));
                assert_eq!(args.inputs.len(), 2);
                assert_eq!(args.params, vec!["n_cpus=4"]);
                assert_eq!(args.flags, "--fs-no-reconall --low-mem");
                assert_eq!(args.json_edits, "TaskName rest");
                assert!(args.json);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_plan_requires_config() {
        assert!(Cli::try_parse_from(["bids-app-wrapper", "plan"]).is_err());
    }

    #[test]
    fn test_log_level_is_global() {
        let cli = Cli::try_parse_from(["bids-app-wrapper", "datatypes", "--log-level", "debug"])
            .expect("should parse");
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_build_request() {
        let cli = Cli::try_parse_from([
            "bids-app-wrapper",
            "run",
            "-c",
            "app.yaml",
            "-i",
            "T1w=/data/t1.nii.gz",
            "-p",
            "n_cpus=8",
            "-p",
            "low_mem",
            "-d",
            "/data/bids",
        ]);
        let Ok(Cli {
            command: Commands::Run(args),
            ..
        }) = cli
        else {
            panic!("Expected Run command");
        };
        let schema = ParameterSchema::builder()
            .parameter("n_cpus", ParamKind::Int)
            .parameter("low_mem", ParamKind::Bool)
            .build()
            .unwrap();

        // A bare name is not an assignment.
        assert!(build_request(&args, &schema).is_err());

        let args = RunArgs {
            params: vec!["n_cpus=8".to_string(), "low_mem=true".to_string()],
            ..args
        };
        let request = build_request(&args, &schema).unwrap();
        assert_eq!(
            request.inputs.get("T1w"),
            Some(std::path::Path::new("/data/t1.nii.gz"))
        );
        assert_eq!(request.parameters["n_cpus"], ParamValue::Int(8));
        assert_eq!(request.parameters["low_mem"], ParamValue::Bool(true));
        assert!(matches!(request.dataset, DatasetSource::Path(ref p) if p == &PathBuf::from("/data/bids")));
    }

    #[test]
    fn test_ill_typed_param_rejected() {
        let cli = Cli::try_parse_from(["bids-app-wrapper", "run", "-c", "a.yaml", "-p", "n_cpus=many"]);
        let Ok(Cli {
            command: Commands::Run(args),
            ..
        }) = cli
        else {
            panic!("Expected Run command");
        };
        let schema = ParameterSchema::builder()
            .parameter("n_cpus", ParamKind::Int)
            .build()
            .unwrap();
        let err = build_request(&args, &schema).unwrap_err();
        assert!(err.to_string().contains("n_cpus"));
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(parse_assignment("a=b=c", "--x").unwrap(), ("a", "b=c"));
        assert!(parse_assignment("=b", "--x").is_err());
        assert!(parse_assignment("ab", "--x").is_err());
    }

    #[test]
    fn test_datatype_entries() {
        let entries = datatype_entries();
        let nifti = entries
            .iter()
            .find(|e| e.id == "medimage/nifti-gz-x")
            .unwrap();
        assert_eq!(nifti.kind, "file");
        assert_eq!(nifti.sidecar, Some(".json"));
    }
}
