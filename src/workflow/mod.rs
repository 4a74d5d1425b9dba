//! Workflow Definition Module
//!
//! Data structures and utilities for defining, parsing and validating
//! workflow documents.
//!
//! # Structure
//!
//! - [`model`]: Document types (WorkflowDefinition, Step, Condition)
//! - [`parser`]: JSON/YAML loading
//! - [`validator`]: Static checks over a document
//! - [`planner`]: Dependency graph and batch planning
//! - [`template`]: `{{...}}` reference resolution
//! - [`path`]: JSONPath-style output extraction
//! - [`condition`]: Check expressions for pre and post conditions
//! - [`inputs`]: Runtime input validation and defaults

pub mod condition;
pub mod inputs;
pub mod model;
pub mod parser;
pub mod path;
pub mod planner;
pub mod template;
pub mod validator;

pub use model::{Condition, Operation, Step, WorkflowDefinition};
pub use parser::{load_workflow, load_workflow_dir, parse_workflow};
pub use planner::{build_plan, ExecutionPlan};
pub use validator::{validate, ValidationReport};
