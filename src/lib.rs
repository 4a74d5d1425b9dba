//! opflow - Declarative API Workflow Engine
//!
//! Replays SaaS operations as dependency-ordered graphs of API calls.
//! A workflow document declares steps, their dependencies and how to undo
//! them; the engine validates it, plans batches of independent steps and
//! runs them in parallel against an injected API collaborator.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Document model, parsing, validation and planning
//! - [`execution`]: Engine, step execution, retries and rollback
//! - [`monitoring`]: Telemetry events and execution timeline
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use opflow::execution::{Engine, FixtureExecutor, Mode};
//! use opflow::load_workflow;
//! use serde_json::{json, Map};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load and validate a workflow
//!     let workflow = load_workflow("create_promotion.yaml")?;
//!
//!     // Answer every call from a fixture file
//!     let executor = FixtureExecutor::from_file("fixtures.json")?;
//!     let mut engine = Engine::new(Arc::new(executor));
//!     engine.set_max_parallel(4);
//!
//!     let mut inputs = Map::new();
//!     inputs.insert("promotion_name".into(), json!("Summer"));
//!     let report = engine.run(&workflow, inputs, Mode::Normal)?;
//!     println!("{}", report.state);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::EngineError;
pub use execution::engine::{Engine, RunReport, RunState};
pub use workflow::model::{Step, WorkflowDefinition};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "opflow";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::Operation;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "opflow");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("create", Operation::Mutation, "createPromotion");
        assert_eq!(step.id, "create");
        assert_eq!(step.api_endpoint, "createPromotion");
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowDefinition::new("create_promotion", "test.create_promotion", "test");
        assert!(workflow.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
