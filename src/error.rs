//! Engine error taxonomy.

use std::path::PathBuf;

use thiserror::Error;

use crate::execution::client::{ApiError, ErrorCode};
use crate::workflow::condition::ConditionError;
use crate::workflow::planner::PlanError;
use crate::workflow::template::TemplateError;
use crate::workflow::validator::ValidationReport;

/// Every way loading or running a workflow can fail.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow failed validation: {0}")]
    Validation(ValidationReport),

    #[error("invalid inputs: {}", .0.join("; "))]
    InvalidInputs(Vec<String>),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("condition '{condition}' could not be evaluated: {source}")]
    ConditionEvaluation {
        condition: String,
        #[source]
        source: ConditionError,
    },

    #[error("condition '{condition}' failed: {message}")]
    ConditionFailed { condition: String, message: String },

    #[error("step '{step_id}' failed after {attempts} attempt(s) [{code}]: {message}")]
    StepExecution {
        step_id: String,
        attempts: u32,
        code: ErrorCode,
        message: String,
    },

    #[error("could not obtain a credential: {0}")]
    Credential(ApiError),

    #[error("step '{step_id}' still rate limited after {attempts} attempt(s)")]
    RateLimited { step_id: String, attempts: u32 },

    #[error("rollback of step '{step_id}' failed: {message}")]
    Rollback { step_id: String, message: String },

    #[error("step '{step_id}' depends on skipped step '{skipped}'")]
    DependencySkipped { step_id: String, skipped: String },

    #[error("step '{step_id}': output '{output}' not found at '{path}'")]
    OutputExtraction {
        step_id: String,
        output: String,
        path: String,
    },

    #[error("sub-workflow cycle: {}", .chain.join(" -> "))]
    SubWorkflowCycle { chain: Vec<String> },

    #[error("sub-workflow nesting exceeds {0} levels")]
    SubWorkflowDepth(usize),

    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("run exceeded its {0}s timeout")]
    Timeout(u64),

    #[error("run was cancelled")]
    Cancelled,

    #[error("failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{path}': {message}")]
    Parse { path: String, message: String },
}

impl EngineError {
    /// Collaborator error code behind this failure, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::StepExecution { code, .. } => Some(*code),
            Self::RateLimited { .. } => Some(ErrorCode::RateLimited),
            Self::Credential(e) => Some(e.code),
            _ => None,
        }
    }

    /// Step the failure is attributed to, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepExecution { step_id, .. }
            | Self::RateLimited { step_id, .. }
            | Self::Rollback { step_id, .. }
            | Self::DependencySkipped { step_id, .. }
            | Self::OutputExtraction { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// Attempts made by the failing step, if any.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::StepExecution { attempts, .. } | Self::RateLimited { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Errors raised before any side effect could happen.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InvalidInputs(_)
                | Self::Plan(_)
                | Self::Io { .. }
                | Self::Parse { .. }
        )
    }
}
