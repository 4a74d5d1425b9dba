//! Workflow Parser
//!
//! Loads workflow documents from JSON or YAML files. The format is picked
//! by extension (`.json` is JSON, everything else is read as YAML, which
//! also accepts JSON). Loading always validates; a document that fails
//! validation is never returned.

use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use serde_json::Value;

use super::model::WorkflowDefinition;
use super::validator::{validate_value, ValidationReport};
use crate::error::EngineError;

/// Reads a document into a JSON value without validating it.
pub fn load_value(path: impl AsRef<Path>) -> Result<Value, EngineError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("Document loaded ({} bytes)", content.len());
    parse_value(&content, is_json(path)).map_err(|message| EngineError::Parse {
        path: path.display().to_string(),
        message,
    })
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn parse_value(content: &str, json: bool) -> Result<Value, String> {
    if json {
        serde_json::from_str(content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }
}

/// Parses and validates a document held in memory.
pub fn parse_workflow(content: &str, json: bool) -> Result<(WorkflowDefinition, ValidationReport), EngineError> {
    let value = parse_value(content, json).map_err(|message| EngineError::Parse {
        path: "<inline>".to_string(),
        message,
    })?;
    from_value(value)
}

fn from_value(value: Value) -> Result<(WorkflowDefinition, ValidationReport), EngineError> {
    let report = validate_value(&value);
    if !report.is_valid() {
        return Err(EngineError::Validation(report));
    }

    let definition: WorkflowDefinition = serde_json::from_value(value).map_err(|e| EngineError::Parse {
        path: "<document>".to_string(),
        message: e.to_string(),
    })?;
    Ok((definition, report))
}

/// Loads and validates a workflow file.
///
/// Warnings are logged; errors reject the document.
///
/// # Example
///
/// ```rust,no_run
/// use opflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("create_promotion.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition, EngineError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let (definition, report) = from_value(load_value(path)?)?;
    for warning in &report.warnings {
        warn!("{}", warning);
    }

    info!(
        "Parsed workflow '{}' with {} steps",
        definition.metadata.workflow_id,
        definition.steps.len()
    );
    Ok(definition)
}

/// Loads every `.yaml`, `.yml` and `.json` workflow in a directory.
///
/// Used to build the sub-workflow registry. Files are read in name order.
pub fn load_workflow_dir(dir: impl AsRef<Path>) -> Result<Vec<WorkflowDefinition>, EngineError> {
    let dir = dir.as_ref();
    let io_error = |source| EngineError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e, "yaml" | "yml" | "json"))
            .unwrap_or(false);
        if supported && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    paths.iter().map(load_workflow).collect()
}

/// Saves a workflow, picking JSON or YAML from the extension.
pub fn save_workflow(workflow: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<(), EngineError> {
    let path = path.as_ref();
    let content = if is_json(path) {
        serde_json::to_string_pretty(workflow).map_err(|e| e.to_string())
    } else {
        serde_yaml::to_string(workflow).map_err(|e| e.to_string())
    }
    .map_err(|message| EngineError::Parse {
        path: path.display().to_string(),
        message,
    })?;

    fs::write(path, content).map_err(|source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}
