//! Individual Step Execution
//!
//! Runs a single workflow step:
//! - Cascade check against skipped dependencies
//! - Template resolution of the payload
//! - Dry-run simulation of side-effecting operations
//! - Rate-limited collaborator calls with retry and backoff
//! - Credential refresh, duplicate recovery, skip and fallback
//! - Output extraction into the run context

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::client::{ApiError, ApiExecutor, ApiRequest, CredentialProvider, ErrorCode};
use super::context::ExecutionContext;
use super::rate_limit::RateLimit;
use super::retry::{RetryPolicy, RetryState};
use crate::error::EngineError;
use crate::monitoring::telemetry::{EventKind, EventSink, TelemetryEvent};
use crate::workflow::model::{
    DuplicatePolicy, ErrorHandling, Operation, QuerySpec, Step, Strategy, WorkflowDefinition,
};
use crate::workflow::path::JsonPath;
use crate::workflow::template::{self, Reference};

/// Runtime state of a step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    /// Outputs were synthesized in dry run
    pub simulated: bool,
    /// The step changed external state and is a rollback candidate
    pub mutated: bool,
    /// A duplicate error was resolved through `fetch_existing`
    pub duplicate_recovered: bool,
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepReport {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: 0,
            duration_ms: 0,
            simulated: false,
            mutated: false,
            duplicate_recovered: false,
            used_fallback: false,
            code: None,
            error: None,
        }
    }
}

/// Report plus the error that failed the step, if any.
#[derive(Debug)]
pub struct StepOutcome {
    pub report: StepReport,
    pub error: Option<EngineError>,
}

/// Result of a successful child run.
#[derive(Debug, Clone)]
pub struct SubWorkflowOutput {
    /// `{"steps": {"<id>": {"outputs": {...}}}}`
    pub value: Value,
    /// Some child step changed external state
    pub mutated: bool,
}

/// Runs nested workflows for `operation: workflow` steps.
pub trait SubWorkflowRunner: Sync {
    /// Runs `workflow_ref` as a child frame of `parent`.
    fn run_sub_workflow(
        &self,
        workflow_ref: &str,
        inputs: Map<String, Value>,
        parent: &ExecutionContext,
    ) -> Result<SubWorkflowOutput, EngineError>;
}

/// One collaborator call target.
struct Call<'s> {
    operation: Operation,
    endpoint: &'s str,
    timeout_ms: Option<u64>,
}

impl<'s> Call<'s> {
    fn of_step(step: &'s Step) -> Self {
        Self {
            operation: step.operation,
            endpoint: &step.api_endpoint,
            timeout_ms: step.timeout_ms,
        }
    }

    fn lookup(query: &'s QuerySpec, timeout_ms: Option<u64>) -> Self {
        Self {
            operation: Operation::Query,
            endpoint: &query.api_endpoint,
            timeout_ms,
        }
    }
}

enum Performed {
    Simulated(Map<String, Value>),
    Returned(Value),
    Nested(SubWorkflowOutput),
}

enum Failure {
    Api { error: ApiError, attempts: u32 },
    Engine(EngineError),
}

impl Failure {
    fn into_error(self, step_id: &str) -> EngineError {
        match self {
            Self::Api { error, attempts } if error.code == ErrorCode::RateLimited => EngineError::RateLimited {
                step_id: step_id.to_string(),
                attempts,
            },
            Self::Api { error, attempts } => EngineError::StepExecution {
                step_id: step_id.to_string(),
                attempts,
                code: error.code,
                message: error.message,
            },
            Self::Engine(e) => e,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Api { error, .. } => error.to_string(),
            Self::Engine(e) => e.to_string(),
        }
    }
}

/// Executes steps against the injected collaborators.
///
/// Shared by every worker thread of a batch.
pub struct StepRunner<'a> {
    pub workflow: &'a WorkflowDefinition,
    pub executor: &'a dyn ApiExecutor,
    pub limiter: &'a dyn RateLimit,
    pub credentials: Option<&'a dyn CredentialProvider>,
    pub sub_workflows: Option<&'a dyn SubWorkflowRunner>,
    pub sink: &'a dyn EventSink,
    pub rate_limit_cap: u32,
}

impl<'a> StepRunner<'a> {
    /// Executes one step to a terminal state.
    pub fn execute(&self, step: &Step, ctx: &ExecutionContext) -> StepOutcome {
        let started = Instant::now();
        let mut report = StepReport::pending(&step.id);
        report.status = StepStatus::Running;

        let result = self.run(step, ctx, &mut report);
        report.duration_ms = started.elapsed().as_millis() as u64;

        let error = match result {
            Ok(status) => {
                report.status = status;
                None
            }
            Err(e) => {
                report.status = StepStatus::Failed;
                report.code = e.code();
                report.error = Some(e.to_string());
                Some(e)
            }
        };

        StepOutcome { report, error }
    }

    fn run(&self, step: &Step, ctx: &ExecutionContext, report: &mut StepReport) -> Result<StepStatus, EngineError> {
        let template = Value::Object(step.inputs.clone());

        let references = template::references(&template)?;
        if let Some(skipped) = references
            .iter()
            .filter_map(Reference::step_id)
            .find(|id| ctx.is_skipped(id))
        {
            return Err(EngineError::DependencySkipped {
                step_id: step.id.clone(),
                skipped: skipped.to_string(),
            });
        }

        let payload = template::resolve(&template, ctx)?;
        let handling = step.handling();

        match self.perform(step, payload, ctx, report, &handling) {
            Ok(performed) => self.finish(&step.id, step, performed, ctx, report),
            Err(failure) => self.recover(step, &handling, failure, ctx, report),
        }
    }

    /// Simulates, delegates to a sub-workflow or calls the collaborator.
    fn perform(
        &self,
        step: &Step,
        payload: Value,
        ctx: &ExecutionContext,
        report: &mut StepReport,
        handling: &ErrorHandling,
    ) -> Result<Performed, Failure> {
        if ctx.mode().is_dry_run() && step.operation.has_side_effects() {
            debug!("Dry run: simulating {} '{}'", step.operation, step.id);
            return Ok(Performed::Simulated(mock_outputs(&step.outputs)));
        }

        if step.operation == Operation::Workflow {
            let workflow_ref = step.workflow_ref.as_deref().unwrap_or_default();
            let runner = self
                .sub_workflows
                .ok_or_else(|| Failure::Engine(EngineError::UnknownWorkflow(workflow_ref.to_string())))?;
            let inputs = match payload {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            report.attempts += 1;
            return runner
                .run_sub_workflow(workflow_ref, inputs, ctx)
                .map(Performed::Nested)
                .map_err(Failure::Engine);
        }

        let policy = RetryPolicy::from_config(&self.workflow.execution_config.retry_policy, handling.max_retries);
        self.call_with_retry(&step.id, Call::of_step(step), payload, ctx, report, policy, handling.strategy)
            .map(Performed::Returned)
    }

    /// Records the outputs of a successful call under `record_as`.
    fn finish(
        &self,
        record_as: &str,
        executed: &Step,
        performed: Performed,
        ctx: &ExecutionContext,
        report: &mut StepReport,
    ) -> Result<StepStatus, EngineError> {
        let outputs = match performed {
            Performed::Simulated(outputs) => {
                report.simulated = true;
                outputs
            }
            Performed::Returned(value) => {
                report.mutated = executed.operation.has_side_effects();
                extract_outputs(record_as, &executed.outputs, &value)?
            }
            Performed::Nested(child) => {
                report.mutated = child.mutated;
                extract_outputs(record_as, &executed.outputs, &child.value)?
            }
        };

        if !ctx.record_outputs(record_as, outputs) {
            warn!("Outputs for step '{}' were already recorded; keeping the first", record_as);
        }
        Ok(StepStatus::Succeeded)
    }

    fn recover(
        &self,
        step: &Step,
        handling: &ErrorHandling,
        failure: Failure,
        ctx: &ExecutionContext,
        report: &mut StepReport,
    ) -> Result<StepStatus, EngineError> {
        if let Failure::Api { error, .. } = &failure {
            if error.code == ErrorCode::Duplicate && handling.on_duplicate == DuplicatePolicy::FetchExisting {
                if let Some(lookup) = &handling.fetch_existing {
                    return self.fetch_existing(step, lookup, handling, ctx, report);
                }
            }
        }

        match (handling.strategy, &handling.fallback) {
            (Strategy::Skip, _) => {
                warn!("Step '{}' failed and was skipped: {}", step.id, failure.describe());
                report.error = Some(failure.describe());
                ctx.mark_skipped(&step.id);
                Ok(StepStatus::Skipped)
            }
            (Strategy::Fallback, Some(fallback)) if !ctx.cancel_handle().is_cancelled() => {
                warn!(
                    "Step '{}' failed ({}), running fallback '{}'",
                    step.id,
                    failure.describe(),
                    fallback.id
                );
                self.run_fallback(step, fallback, ctx, report)
            }
            _ => Err(failure.into_error(&step.id)),
        }
    }

    /// Resolves a duplicate by reading the existing entity.
    fn fetch_existing(
        &self,
        step: &Step,
        lookup: &QuerySpec,
        handling: &ErrorHandling,
        ctx: &ExecutionContext,
        report: &mut StepReport,
    ) -> Result<StepStatus, EngineError> {
        info!(
            "Step '{}' hit a duplicate, fetching the existing entity via '{}'",
            step.id, lookup.api_endpoint
        );

        let payload = template::resolve(&Value::Object(lookup.inputs.clone()), ctx)?;
        let policy = RetryPolicy::from_config(&self.workflow.execution_config.retry_policy, handling.max_retries);
        let value = self
            .call_with_retry(
                &step.id,
                Call::lookup(lookup, step.timeout_ms),
                payload,
                ctx,
                report,
                policy,
                handling.strategy,
            )
            .map_err(|f| f.into_error(&step.id))?;

        let paths = if lookup.outputs.is_empty() { &step.outputs } else { &lookup.outputs };
        let outputs = extract_outputs(&step.id, paths, &value)?;
        if !ctx.record_outputs(&step.id, outputs) {
            warn!("Outputs for step '{}' were already recorded; keeping the first", step.id);
        }

        report.duplicate_recovered = true;
        Ok(StepStatus::Succeeded)
    }

    /// Runs the inline fallback in place of `step`.
    fn run_fallback(
        &self,
        step: &Step,
        fallback: &Step,
        ctx: &ExecutionContext,
        report: &mut StepReport,
    ) -> Result<StepStatus, EngineError> {
        report.used_fallback = true;

        let payload = template::resolve(&Value::Object(fallback.inputs.clone()), ctx)?;
        let handling = fallback.handling();

        match self.perform(fallback, payload, ctx, report, &handling) {
            Ok(performed) => self.finish(&step.id, fallback, performed, ctx, report),
            Err(failure) => Err(failure.into_error(&step.id)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn call_with_retry(
        &self,
        step_id: &str,
        call: Call<'_>,
        payload: Value,
        ctx: &ExecutionContext,
        report: &mut StepReport,
        policy: RetryPolicy,
        strategy: Strategy,
    ) -> Result<Value, Failure> {
        let mut state = RetryState::new(policy, self.rate_limit_cap);

        loop {
            state.begin_attempt();
            report.attempts += 1;

            self.limiter.acquire();
            let request = ApiRequest {
                operation: call.operation,
                endpoint: call.endpoint.to_string(),
                payload: payload.clone(),
                credential: ctx.credential(),
                timeout: call.timeout_ms.map(Duration::from_millis),
            };

            let error = match self.executor.call(&request) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let delay = match error.code {
                ErrorCode::InvalidCredentials => self.refresh_credential(ctx, &mut state),
                ErrorCode::RateLimited => state.schedule_rate_limited(error.retry_after_ms),
                code if strategy == Strategy::Retry && code.is_retryable() => state.schedule_retry(),
                _ => None,
            };

            let Some(delay) = delay else {
                return Err(Failure::Api {
                    error,
                    attempts: state.attempts(),
                });
            };

            if ctx.cancel_handle().is_cancelled() {
                info!("Run cancelled; not retrying step '{}'", step_id);
                return Err(Failure::Api {
                    error,
                    attempts: state.attempts(),
                });
            }

            warn!(
                "Step '{}' attempt {} failed ({}), retrying in {:?}",
                step_id,
                state.attempts(),
                error,
                delay
            );
            self.sink.emit(
                &TelemetryEvent::new(ctx.trace_id(), &self.workflow.metadata.workflow_id, EventKind::StepRetried)
                    .for_step(step_id)
                    .with_attempt(state.attempts())
                    .with_status(error.code.as_str())
                    .with_duration(delay.as_millis() as u64),
            );

            if !ctx.cancel_handle().sleep(delay) {
                info!("Run cancelled during backoff of step '{}'", step_id);
                return Err(Failure::Api {
                    error,
                    attempts: state.attempts(),
                });
            }
        }
    }

    /// Fetches a fresh credential once per step invocation.
    fn refresh_credential(&self, ctx: &ExecutionContext, state: &mut RetryState) -> Option<Duration> {
        let provider = self.credentials?;
        if !state.take_credential_refresh() {
            return None;
        }

        match provider.get_credential(self.workflow.security.credential_scope.as_deref()) {
            Ok(credential) => {
                info!("Credential refreshed after invalid_credentials");
                ctx.set_credential(credential);
                Some(Duration::ZERO)
            }
            Err(e) => {
                warn!("Credential refresh failed: {}", e);
                None
            }
        }
    }
}

/// Applies output extraction paths to a call result.
pub fn extract_outputs(
    step_id: &str,
    paths: &BTreeMap<String, String>,
    result: &Value,
) -> Result<Map<String, Value>, EngineError> {
    let mut outputs = Map::new();
    for (name, raw) in paths {
        let value = JsonPath::parse(raw)
            .ok()
            .and_then(|path| path.lookup(result).cloned())
            .ok_or_else(|| EngineError::OutputExtraction {
                step_id: step_id.to_string(),
                output: name.clone(),
                path: raw.clone(),
            })?;
        outputs.insert(name.clone(), value);
    }
    Ok(outputs)
}

/// Placeholder outputs for a simulated step, shaped by each output's name.
pub fn mock_outputs(paths: &BTreeMap<String, String>) -> Map<String, Value> {
    paths.keys().map(|key| (key.clone(), mock_value(key))).collect()
}

fn mock_value(key: &str) -> Value {
    let lowered = key.to_lowercase();
    if lowered.contains("id") {
        let suffix = Uuid::new_v4().simple().to_string();
        Value::String(format!("mock_{}_{}", key, &suffix[..8]))
    } else if lowered.contains("name") {
        Value::String(format!("Mock {}", title_case(key)))
    } else if lowered.contains("date") || lowered.contains("time") {
        Value::String(Utc::now().to_rfc3339())
    } else if lowered.contains("count") {
        Value::from(42)
    } else {
        Value::String(format!("<mock_{}>", key))
    }
}

/// Upper-cases the first letter of every alphabetic run.
fn title_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut at_boundary = true;
    for c in key.chars() {
        if c.is_alphabetic() {
            if at_boundary {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_boundary = false;
        } else {
            out.push(c);
            at_boundary = true;
        }
    }
    out
}
