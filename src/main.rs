//! opflow CLI Entry Point
//!
//! Validates, plans and runs workflow documents.
//!
//! # Usage
//!
//! ```bash
//! # Check a document
//! opflow validate create_promotion.yaml --strict
//!
//! # Show the execution batches
//! opflow plan create_promotion.yaml
//!
//! # Replay a run against recorded responses
//! opflow run create_promotion.yaml --inputs '{"promotion_name": "Summer"}' --fixtures fixtures.json
//!
//! # Simulate mutations, perform reads
//! opflow run create_promotion.yaml --inputs @inputs.yaml --dry-run --fixtures fixtures.json
//! ```

use std::env;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use log::{info, warn};
use serde_json::{Map, Value};

use opflow::config::EngineConfig;
use opflow::execution::{Engine, FixtureExecutor, Mode, RunReport, RunState, StaticCredentials, StepStatus};
use opflow::workflow::parser::{load_value, load_workflow, load_workflow_dir};
use opflow::workflow::planner::build_plan;
use opflow::workflow::validator::validate_value;
use opflow::{APP_NAME, VERSION};

#[derive(Parser)]
#[command(name = "opflow")]
#[command(about = "Declarative API workflow engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow document
    Validate {
        /// Path to a YAML or JSON workflow
        file: PathBuf,

        /// Treat warnings as errors
        #[arg(long)]
        strict: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the execution batches of a workflow
    Plan {
        /// Path to a YAML or JSON workflow
        file: PathBuf,
    },

    /// Run a workflow
    Run {
        /// Path to a YAML or JSON workflow
        file: PathBuf,

        /// Runtime inputs as inline JSON, or @path to a JSON/YAML file
        #[arg(short, long)]
        inputs: Option<String>,

        /// Perform reads, simulate mutations
        #[arg(long)]
        dry_run: bool,

        /// Recorded collaborator responses
        #[arg(long)]
        fixtures: Option<PathBuf>,

        /// Engine configuration file
        #[arg(long, env = "OPFLOW_CONFIG")]
        config: Option<PathBuf>,

        /// Directory of workflows available to sub-workflow steps
        #[arg(long)]
        workflows: Option<PathBuf>,

        /// Environment variable holding the API credential
        #[arg(long)]
        credential_env: Option<String>,

        /// Maximum parallel steps
        #[arg(long)]
        parallel: Option<usize>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Declarative API Workflow Engine");
    println!();
}

fn validate_command(file: &Path, strict: bool, json: bool) -> Result<ExitCode, Box<dyn Error>> {
    let document = load_value(file)?;
    let mut report = validate_value(&document);
    if strict {
        report = report.strict();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for issue in &report.errors {
            println!("{} {}", "error:".red().bold(), issue);
        }
        for issue in &report.warnings {
            println!("{} {}", "warning:".yellow().bold(), issue);
        }
        for note in &report.info {
            println!("{} {}", "info:".dimmed(), note);
        }
        if report.is_valid() {
            println!("{} {}", "valid".green().bold(), file.display());
        } else {
            println!("{} {} ({} error(s))", "invalid".red().bold(), file.display(), report.errors.len());
        }
    }

    Ok(if report.is_valid() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn plan_command(file: &Path) -> Result<ExitCode, Box<dyn Error>> {
    let workflow = load_workflow(file)?;
    let plan = build_plan(&workflow.steps, workflow.execution_config.parallel)?;

    println!(
        "{} ({} steps, parallel: {})",
        workflow.metadata.workflow_id.bold(),
        plan.len(),
        plan.parallel
    );
    for (index, batch) in plan.batches.iter().enumerate() {
        println!("  batch {}: {}", index + 1, batch.join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

/// Parses `--inputs`: inline JSON, or `@path` to a document.
fn parse_inputs(raw: Option<&str>) -> Result<Map<String, Value>, Box<dyn Error>> {
    let value = match raw {
        None => return Ok(Map::new()),
        Some(raw) => match raw.strip_prefix('@') {
            Some(path) => load_value(path)?,
            None => serde_json::from_str(raw)?,
        },
    };

    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!("inputs must be an object, got {}", other).into()),
    }
}

fn engine_config(path: Option<&Path>, parallel: Option<usize>) -> Result<EngineConfig, Box<dyn Error>> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    }
    .apply_env();

    if let Some(n) = parallel {
        config.max_parallel = n.max(1);
    }
    Ok(config)
}

#[allow(clippy::too_many_arguments)]
fn run_command(
    file: &Path,
    inputs: Option<&str>,
    dry_run: bool,
    fixtures: Option<&Path>,
    config: Option<&Path>,
    workflows: Option<&Path>,
    credential_env: Option<&str>,
    parallel: Option<usize>,
    json: bool,
) -> Result<ExitCode, Box<dyn Error>> {
    let workflow = load_workflow(file)?;
    let inputs = parse_inputs(inputs)?;
    let config = engine_config(config, parallel)?;

    let executor = match fixtures {
        Some(path) => {
            info!("Replaying responses from {}", path.display());
            FixtureExecutor::from_file(path)?
        }
        None if dry_run => {
            warn!("No fixtures given; reads answer with empty objects");
            FixtureExecutor::new().lenient()
        }
        None => return Err("no API executor available; pass --fixtures or --dry-run".into()),
    };

    let mut engine = Engine::new(Arc::new(executor));
    engine.set_config(config);

    if let Some(var) = credential_env {
        let credential = env::var(var).map_err(|_| format!("credential variable '{}' is not set", var))?;
        engine.set_credentials(Arc::new(StaticCredentials::new(credential)));
    }

    if let Some(dir) = workflows {
        for nested in load_workflow_dir(dir)? {
            engine.register_workflow(nested)?;
        }
    }

    let mode = if dry_run { Mode::DryRun } else { Mode::Normal };
    if dry_run {
        info!("Mode: DRY RUN (mutations will be simulated)");
    }

    let report = engine.run(&workflow, inputs, mode)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(match report.state {
        RunState::Succeeded => ExitCode::SUCCESS,
        RunState::RolledBack => ExitCode::from(2),
        RunState::Cancelled => ExitCode::from(3),
        _ => ExitCode::FAILURE,
    })
}

fn print_report(report: &RunReport) {
    println!();
    for step in &report.steps {
        let status = match step.status {
            StepStatus::Succeeded if step.simulated => "simulated".cyan(),
            StepStatus::Succeeded => "succeeded".green(),
            StepStatus::Skipped => "skipped".yellow(),
            _ => "failed".red(),
        };
        println!(
            "  {:24} {:10} {} attempt(s), {} ms",
            step.step_id, status, step.attempts, step.duration_ms
        );
    }

    if !report.rollback.is_empty() {
        println!("\nRollback:");
        for record in &report.rollback {
            println!("  {:24} {}", record.step_id, record.outcome.as_str());
        }
    }

    print!("{}", report.timeline.gantt_chart());

    let state = match report.state {
        RunState::Succeeded => report.state.as_str().green().bold(),
        RunState::RolledBack | RunState::Cancelled => report.state.as_str().yellow().bold(),
        _ => report.state.as_str().red().bold(),
    };
    println!("\nRun {} ({}): {}", report.trace_id, report.workflow_id, state);
    if let Some(failure) = &report.failure {
        println!("  {}", failure.message);
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn Error>> {
    match cli.command {
        Commands::Validate { file, strict, json } => validate_command(&file, strict, json),
        Commands::Plan { file } => plan_command(&file),
        Commands::Run {
            file,
            inputs,
            dry_run,
            fixtures,
            config,
            workflows,
            credential_env,
            parallel,
            json,
        } => run_command(
            &file,
            inputs.as_deref(),
            dry_run,
            fixtures.as_deref(),
            config.as_deref(),
            workflows.as_deref(),
            credential_env.as_deref(),
            parallel,
            json,
        ),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    if matches!(cli.command, Commands::Run { json: false, .. }) {
        print_banner();
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_parse_inline_inputs() {
        let inputs = parse_inputs(Some(r#"{"promotion_name": "Summer"}"#)).unwrap();
        assert_eq!(inputs["promotion_name"], "Summer");
    }

    #[test]
    fn test_parse_inputs_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inputs.yaml");
        fs::write(&path, "promotion_name: Winter\ndiscount: 10\n").unwrap();

        let inputs = parse_inputs(Some(&format!("@{}", path.display()))).unwrap();
        assert_eq!(inputs["promotion_name"], "Winter");
        assert_eq!(inputs["discount"], 10);
    }

    #[test]
    fn test_parse_inputs_rejects_non_object() {
        assert!(parse_inputs(Some("[1, 2]")).is_err());
        assert!(parse_inputs(None).unwrap().is_empty());
    }

    #[test]
    fn test_parallel_flag_overrides_config() {
        let config = engine_config(None, Some(0)).unwrap();
        assert_eq!(config.max_parallel, 1);
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "opflow", "run", "wf.yaml", "--dry-run", "--fixtures", "f.json", "--credential-env", "API_TOKEN",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                dry_run,
                fixtures,
                credential_env,
                ..
            } => {
                assert!(dry_run);
                assert_eq!(fixtures, Some(PathBuf::from("f.json")));
                assert_eq!(credential_env.as_deref(), Some("API_TOKEN"));
            }
            _ => panic!("expected run"),
        }
    }
}
