//! Workflow Data Model
//!
//! Core data structures representing a workflow document: metadata,
//! declared inputs, security policy, pre/post conditions, steps and the
//! execution configuration.
//!
//! # Example YAML Format
//!
//! ```yaml
//! metadata:
//!   workflow_name: create_promotion
//!   workflow_id: vendure.create_promotion
//!   platform: vendure
//!   schema_version: 1.0.0
//!   idempotent: false
//!
//! inputs:
//!   required:
//!     promotion_name: { type: string, description: Display name }
//!
//! security:
//!   auth_required: true
//!   secrets_handling: runtime_injected
//!
//! steps:
//!   - id: create
//!     operation: mutation
//!     api_endpoint: createPromotion
//!     inputs:
//!       name: "{{inputs.promotion_name}}"
//!     outputs:
//!       promotion_id: $.createPromotion.id
//!
//!   - id: add_condition
//!     operation: mutation
//!     api_endpoint: addPromotionCondition
//!     depends_on: [create]
//!     inputs:
//!       promotion_id: "{{steps.create.outputs.promotion_id}}"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A complete workflow document.
///
/// Immutable once parsed; a single definition may be shared by any number
/// of concurrent runs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkflowDefinition {
    pub metadata: Metadata,

    #[serde(default)]
    pub inputs: InputSpec,

    #[serde(default)]
    pub security: Security,

    #[serde(default)]
    pub validation: ValidationRules,

    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default)]
    pub execution_config: ExecutionConfig,

    #[serde(default)]
    pub observability: Observability,

    /// Free-form documentation carried along with the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<Value>,
}

impl WorkflowDefinition {
    /// Creates a workflow with the given identity and no steps.
    pub fn new(name: impl Into<String>, id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            metadata: Metadata {
                workflow_name: name.into(),
                workflow_id: id.into(),
                platform: platform.into(),
                schema_version: "1.0.0".to_string(),
                idempotent: None,
                description: None,
            },
            inputs: InputSpec::default(),
            security: Security::default(),
            validation: ValidationRules::default(),
            steps: Vec::new(),
            execution_config: ExecutionConfig::default(),
            observability: Observability::default(),
            documentation: None,
        }
    }

    /// Appends a step, builder style.
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Returns steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns true if the given name is declared as a required or optional input.
    pub fn declares_input(&self, name: &str) -> bool {
        self.inputs.required.contains_key(name) || self.inputs.optional.contains_key(name)
    }
}

/// Identity and descriptive information for a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Metadata {
    #[serde(default, alias = "name")]
    pub workflow_name: String,

    #[serde(default, alias = "id")]
    pub workflow_id: String,

    #[serde(default)]
    pub platform: String,

    #[serde(default)]
    pub schema_version: String,

    /// Whether re-running the workflow with the same inputs is safe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declared workflow parameters.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InputSpec {
    #[serde(default)]
    pub required: BTreeMap<String, ParamSpec>,

    #[serde(default)]
    pub optional: BTreeMap<String, ParamSpec>,
}

impl InputSpec {
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }
}

/// Type of a declared input parameter.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    /// Checks whether a JSON value is of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Specification of one input parameter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ParamSpec {
    /// Missing types are reported by the validator
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub param_type: Option<ParamType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<InputRule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn new(param_type: ParamType) -> Self {
        Self {
            param_type: Some(param_type),
            description: None,
            validation: None,
            default: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_rule(mut self, rule: InputRule) -> Self {
        self.validation = Some(rule);
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Value constraints for an input parameter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InputRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

/// How credentials reach the engine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecretsHandling {
    RuntimeInjected,
    Vault,
    EnvVar,
}

/// Security policy for a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Security {
    /// Must be declared explicitly; the validator flags `None`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_handling: Option<SecretsHandling>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_role: Option<String>,

    /// Field names redacted from logs and telemetry
    #[serde(default)]
    pub pii_fields: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,

    /// Scope passed to the credential provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_scope: Option<String>,
}

impl Security {
    pub fn requires_auth(&self) -> bool {
        self.auth_required.unwrap_or(false)
    }
}

/// Token bucket parameters: `max_requests` per `per_seconds`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSpec {
    pub max_requests: u32,

    #[serde(default = "default_rate_period")]
    pub per_seconds: u64,
}

fn default_rate_period() -> u64 {
    1
}

/// Ordered pre and post conditions.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ValidationRules {
    #[serde(default)]
    pub pre_conditions: Vec<Condition>,

    #[serde(default)]
    pub post_conditions: Vec<Condition>,
}

impl ValidationRules {
    pub fn is_empty(&self) -> bool {
        self.pre_conditions.is_empty() && self.post_conditions.is_empty()
    }
}

/// A pre- or post-condition.
///
/// `check` is a predicate over the subject data, e.g. `$.items is empty`
/// or `$.promotion.enabled == true`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Condition {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Read operation whose result becomes the subject of `check`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QuerySpec>,

    /// Post-conditions only: the step whose success triggers this check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_step: Option<String>,

    pub check: String,

    #[serde(default = "default_true")]
    pub critical: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Condition {
    pub fn new(id: impl Into<String>, check: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            query: None,
            after_step: None,
            check: check.into(),
            critical: true,
            error_message: None,
        }
    }

    pub fn with_query(mut self, query: QuerySpec) -> Self {
        self.query = Some(query);
        self
    }

    pub fn after(mut self, step_id: impl Into<String>) -> Self {
        self.after_step = Some(step_id.into());
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }
}

fn default_true() -> bool {
    true
}

/// A read-only call used by conditions and duplicate recovery.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct QuerySpec {
    pub api_endpoint: String,

    #[serde(default)]
    pub inputs: Map<String, Value>,

    /// Output name -> extraction path, used by `fetch_existing` lookups
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

impl QuerySpec {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            api_endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), path.into());
        self
    }
}

/// Kind of work a step performs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Read-only call, safe to execute in dry-run
    Query,
    /// State-changing call
    Mutation,
    /// Invocation of another registered workflow
    Workflow,
    /// Platform specific call with unknown side effects
    Custom,
}

impl Operation {
    /// Operations that must not reach the collaborator in dry-run.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, Self::Mutation | Self::Custom)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Workflow => "workflow",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single step in a workflow.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Step {
    /// Unique snake_case identifier
    pub id: String,

    pub operation: Operation,

    /// Endpoint, GraphQL operation name or custom handler key
    #[serde(default)]
    pub api_endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Payload template; strings may contain `{{...}}` references
    #[serde(default)]
    pub inputs: Map<String, Value>,

    /// Output name -> extraction path applied to the call result
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// IDs of steps that must complete before this step can run
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_operation: Option<RollbackOperation>,

    /// Workflow id invoked by `operation: workflow`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_ref: Option<String>,

    /// Per-call timeout handed to the collaborator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Step {
    /// Creates a new Step.
    ///
    /// # Example
    ///
    /// ```
    /// use opflow::workflow::{Operation, Step};
    /// use serde_json::json;
    ///
    /// let step = Step::new("create", Operation::Mutation, "createPromotion")
    ///     .with_input("name", json!("{{inputs.name}}"))
    ///     .with_output("promotion_id", "$.createPromotion.id");
    /// assert_eq!(step.outputs.len(), 1);
    /// ```
    pub fn new(id: impl Into<String>, operation: Operation, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            operation,
            api_endpoint: endpoint.into().trim().to_string(),
            description: None,
            inputs: Map::new(),
            outputs: BTreeMap::new(),
            depends_on: Vec::new(),
            error_handling: None,
            rollback_operation: None,
            workflow_ref: None,
            timeout_ms: None,
        }
    }

    /// Creates a step that invokes another registered workflow.
    pub fn sub_workflow(id: impl Into<String>, workflow_ref: impl Into<String>) -> Self {
        let mut step = Self::new(id, Operation::Workflow, "");
        step.workflow_ref = Some(workflow_ref.into());
        step
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), path.into());
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_error_handling(mut self, handling: ErrorHandling) -> Self {
        self.error_handling = Some(handling);
        self
    }

    pub fn with_rollback(mut self, rollback: RollbackOperation) -> Self {
        self.rollback_operation = Some(rollback);
        self
    }

    /// Error handling in effect, defaulting to abort.
    pub fn handling(&self) -> ErrorHandling {
        self.error_handling.clone().unwrap_or_default()
    }
}

/// What to do when a step's call fails.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Abort,
    Retry,
    Skip,
    Fallback,
}

/// Reaction to a duplicate-entity error from the collaborator.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    Fail,
    FetchExisting,
}

/// Per-step error handling configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ErrorHandling {
    #[serde(default)]
    pub strategy: Strategy,

    /// Overrides `execution_config.retry_policy.max_retries`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default)]
    pub on_duplicate: DuplicatePolicy,

    /// Lookup issued when `on_duplicate` is `fetch_existing`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_existing: Option<QuerySpec>,

    /// Alternate step executed in place of this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Box<Step>>,
}

impl ErrorHandling {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn fetch_existing(mut self, lookup: QuerySpec) -> Self {
        self.on_duplicate = DuplicatePolicy::FetchExisting;
        self.fetch_existing = Some(lookup);
        self
    }

    pub fn with_fallback(mut self, step: Step) -> Self {
        self.strategy = Strategy::Fallback;
        self.fallback = Some(Box::new(step));
        self
    }
}

/// Inverse call that compensates a successful mutation.
///
/// Inputs may reference the step's own outputs, e.g.
/// `{{steps.create.outputs.promotion_id}}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RollbackOperation {
    #[serde(default = "default_rollback_operation")]
    pub operation: Operation,

    pub api_endpoint: String,

    #[serde(default)]
    pub inputs: Map<String, Value>,
}

impl RollbackOperation {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            operation: Operation::Mutation,
            api_endpoint: endpoint.into(),
            inputs: Map::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }
}

fn default_rollback_operation() -> Operation {
    Operation::Mutation
}

/// Workflow-wide retry defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

/// Execution settings for a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExecutionConfig {
    /// Run independent steps of a batch concurrently
    #[serde(default)]
    pub parallel: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,

    #[serde(default)]
    pub dry_run_supported: bool,

    #[serde(default)]
    pub rollback_supported: bool,

    /// Caps concurrent steps below the engine setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
}

/// Audit and telemetry settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Observability {
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AuditConfig {
    /// Attach (redacted) step inputs to telemetry events
    #[serde(default)]
    pub log_inputs: bool,

    /// Attach (redacted) step outputs to telemetry events
    #[serde(default)]
    pub log_outputs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_builder() {
        let step = Step::new("create", Operation::Mutation, "createPromotion")
            .with_input("name", json!("{{inputs.name}}"))
            .with_output("id", "$.createPromotion.id")
            .depends_on("lookup");

        assert_eq!(step.id, "create");
        assert_eq!(step.depends_on, vec!["lookup"]);
        assert_eq!(step.outputs.get("id").unwrap(), "$.createPromotion.id");
        assert_eq!(step.handling().strategy, Strategy::Abort);
    }

    #[test]
    fn test_step_id_is_trimmed() {
        let step = Step::new("  padded ", Operation::Query, " getThing ");
        assert_eq!(step.id, "padded");
        assert_eq!(step.api_endpoint, "getThing");
    }

    #[test]
    fn test_operation_side_effects() {
        assert!(Operation::Mutation.has_side_effects());
        assert!(Operation::Custom.has_side_effects());
        assert!(!Operation::Query.has_side_effects());
        assert!(!Operation::Workflow.has_side_effects());
    }

    #[test]
    fn test_deserialize_full_document() {
        let doc = json!({
            "metadata": {
                "workflow_name": "create_promotion",
                "workflow_id": "vendure.create_promotion",
                "platform": "vendure",
                "schema_version": "1.0.0",
                "idempotent": false
            },
            "inputs": {
                "required": {
                    "name": { "type": "string", "description": "Promotion name" }
                }
            },
            "security": {
                "auth_required": true,
                "secrets_handling": "runtime_injected",
                "pii_fields": ["email"]
            },
            "steps": [{
                "id": "create",
                "operation": "mutation",
                "api_endpoint": "createPromotion",
                "inputs": { "name": "{{inputs.name}}" },
                "outputs": { "id": "$.createPromotion.id" },
                "error_handling": {
                    "strategy": "retry",
                    "max_retries": 2,
                    "on_duplicate": "fetch_existing",
                    "fetch_existing": {
                        "api_endpoint": "promotions",
                        "outputs": { "id": "$.items[0].id" }
                    }
                },
                "rollback_operation": {
                    "api_endpoint": "deletePromotion",
                    "inputs": { "id": "{{steps.create.outputs.id}}" }
                }
            }],
            "execution_config": { "parallel": true, "rollback_supported": true }
        });

        let wf: WorkflowDefinition = serde_json::from_value(doc).unwrap();
        assert_eq!(wf.metadata.workflow_id, "vendure.create_promotion");
        assert_eq!(wf.inputs.required["name"].param_type, Some(ParamType::String));
        assert_eq!(wf.security.secrets_handling, Some(SecretsHandling::RuntimeInjected));

        let step = &wf.steps[0];
        let handling = step.handling();
        assert_eq!(handling.strategy, Strategy::Retry);
        assert_eq!(handling.max_retries, Some(2));
        assert_eq!(handling.on_duplicate, DuplicatePolicy::FetchExisting);
        assert_eq!(step.rollback_operation.as_ref().unwrap().operation, Operation::Mutation);
        assert!(wf.execution_config.parallel);
        assert_eq!(wf.execution_config.retry_policy, RetryPolicyConfig::default());
    }

    #[test]
    fn test_metadata_aliases() {
        let meta: Metadata =
            serde_json::from_value(json!({ "name": "wf", "id": "wf.id" })).unwrap();
        assert_eq!(meta.workflow_name, "wf");
        assert_eq!(meta.workflow_id, "wf.id");
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let result: Result<Step, _> =
            serde_json::from_value(json!({ "id": "x", "operation": "delete" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_param_type_accepts() {
        assert!(ParamType::Integer.accepts(&json!(3)));
        assert!(!ParamType::Integer.accepts(&json!(3.5)));
        assert!(ParamType::Number.accepts(&json!(3.5)));
        assert!(ParamType::Object.accepts(&json!({})));
        assert!(!ParamType::String.accepts(&json!(null)));
    }

    #[test]
    fn test_condition_defaults_to_critical() {
        let cond: Condition =
            serde_json::from_value(json!({ "id": "c", "check": "$.ok" })).unwrap();
        assert!(cond.critical);
        assert!(!Condition::new("c", "$.ok").non_critical().critical);
    }

    #[test]
    fn test_workflow_helpers() {
        let wf = WorkflowDefinition::new("wf", "wf.id", "test")
            .with_step(Step::new("a", Operation::Query, "getA"))
            .with_step(Step::new("b", Operation::Query, "getB").depends_on("a"));

        assert_eq!(wf.len(), 2);
        assert!(!wf.is_empty());
        assert_eq!(wf.root_steps().len(), 1);
        assert!(wf.get_step("b").is_some());
        assert!(wf.get_step("c").is_none());
    }
}
