//! Workflow Execution Engine
//!
//! The core engine that orchestrates a workflow run:
//! - Validation and runtime input checking
//! - Batch scheduling on scoped worker threads
//! - Pre and post condition gating
//! - Rollback of completed mutations after a failure
//! - Dry-run simulation, cancellation and run timeouts
//! - Nested sub-workflow frames

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::client::{ApiExecutor, ApiRequest, CredentialProvider, ErrorCode};
use super::context::{CancelHandle, ExecutionContext, Mode};
use super::rate_limit::{RateLimit, TokenBucket, Unlimited};
use super::rollback::{Rollback, RollbackOutcome, RollbackRecord};
use super::step::{StepOutcome, StepReport, StepRunner, StepStatus, SubWorkflowOutput, SubWorkflowRunner};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::monitoring::telemetry::{redact, EventKind, EventSink, LogSink, TelemetryEvent};
use crate::monitoring::timeline::{EventType, ExecutionTimeline};
use crate::workflow::condition;
use crate::workflow::inputs::resolve_inputs;
use crate::workflow::model::{Condition, Operation, QuerySpec, Step, WorkflowDefinition};
use crate::workflow::planner::{build_plan, ExecutionPlan};
use crate::workflow::template;
use crate::workflow::validator::validate;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initialized,
    Planning,
    Running,
    Succeeded,
    Failed,
    RolledBack,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::RolledBack | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConditionOutcome {
    pub condition_id: String,
    /// `pre` or `post`
    pub phase: &'static str,
    pub status: ConditionStatus,
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConditionOutcome {
    fn skipped(condition: &Condition, phase: &'static str, reason: impl Into<String>) -> Self {
        Self {
            condition_id: condition.id.clone(),
            phase,
            status: ConditionStatus::Skipped,
            critical: condition.critical,
            message: Some(reason.into()),
        }
    }
}

/// Why a run did not succeed.
#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub message: String,
}

impl From<&EngineError> for FailureSummary {
    fn from(error: &EngineError) -> Self {
        Self {
            step_id: error.step_id().map(str::to_string),
            attempts: error.attempts(),
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub workflow_id: String,
    pub trace_id: Uuid,
    pub mode: Mode,
    pub state: RunState,
    pub plan: ExecutionPlan,
    /// Step reports in completion order
    pub steps: Vec<StepReport>,
    pub outputs: BTreeMap<String, Map<String, Value>>,
    pub conditions: Vec<ConditionOutcome>,
    pub rollback: Vec<RollbackRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
    pub duration_ms: u64,
    #[serde(skip)]
    pub timeline: ExecutionTimeline,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Succeeded
    }

    pub fn step(&self, step_id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|r| r.step_id == step_id)
    }
}

/// A finished run plus the error that ended it, kept for nested frames.
struct Execution {
    report: RunReport,
    error: Option<EngineError>,
}

#[derive(Default)]
struct RunLog {
    steps: Vec<StepReport>,
    conditions: Vec<ConditionOutcome>,
    timeline: ExecutionTimeline,
    failure: Option<EngineError>,
}

impl RunLog {
    fn fail(&mut self, error: EngineError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    fn succeeded(&self, step_id: &str) -> bool {
        self.steps
            .iter()
            .any(|r| r.step_id == step_id && r.status == StepStatus::Succeeded)
    }
}

/// Workflow execution engine.
///
/// Holds the injected collaborators and the registry of workflows that
/// `operation: workflow` steps may invoke. One engine can drive any number
/// of runs; every run gets its own [`ExecutionContext`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use opflow::execution::{Engine, FixtureExecutor, Mode};
/// use opflow::load_workflow;
/// use serde_json::Map;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("create_promotion.yaml")?;
///     let executor = FixtureExecutor::from_file("fixtures.json")?;
///
///     let mut engine = Engine::new(Arc::new(executor));
///     engine.set_max_parallel(4);
///
///     let report = engine.run(&workflow, Map::new(), Mode::DryRun)?;
///     println!("{}", report.state);
///     Ok(())
/// }
/// ```
pub struct Engine {
    executor: Arc<dyn ApiExecutor>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    limiter: Option<Arc<dyn RateLimit>>,
    sink: Arc<dyn EventSink>,
    registry: HashMap<String, WorkflowDefinition>,
    env: Option<HashMap<String, String>>,
    config: EngineConfig,
}

impl Engine {
    /// Creates an engine that sends every call to `executor`.
    pub fn new(executor: Arc<dyn ApiExecutor>) -> Self {
        Self {
            executor,
            credentials: None,
            limiter: None,
            sink: Arc::new(LogSink),
            registry: HashMap::new(),
            env: None,
            config: EngineConfig::default(),
        }
    }

    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sets the maximum number of concurrently running steps.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.config.max_parallel = max.max(1);
    }

    /// Shares one limiter across every run of this engine.
    ///
    /// Without it each run builds a token bucket from the workflow's
    /// `security.rate_limit`, if declared.
    pub fn set_rate_limiter(&mut self, limiter: Arc<dyn RateLimit>) {
        self.limiter = Some(limiter);
    }

    pub fn set_credentials(&mut self, provider: Arc<dyn CredentialProvider>) {
        self.credentials = Some(provider);
    }

    pub fn set_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sink = sink;
    }

    /// Replaces the process environment seen by `{{env.*}}` templates.
    pub fn set_env(&mut self, env: HashMap<String, String>) {
        self.env = Some(env);
    }

    /// Makes a workflow available to sub-workflow steps under its id.
    pub fn register_workflow(&mut self, workflow: WorkflowDefinition) -> Result<(), EngineError> {
        let report = validate(&workflow);
        if !report.is_valid() {
            return Err(EngineError::Validation(report));
        }
        debug!("Registered workflow '{}'", workflow.metadata.workflow_id);
        self.registry.insert(workflow.metadata.workflow_id.clone(), workflow);
        Ok(())
    }

    pub fn is_registered(&self, workflow_id: &str) -> bool {
        self.registry.contains_key(workflow_id)
    }

    /// Executes a workflow.
    ///
    /// Structural problems (validation, inputs, planning) are returned as
    /// errors before any call is made. Everything that happens once steps
    /// start running is described by the returned [`RunReport`].
    pub fn run(
        &self,
        workflow: &WorkflowDefinition,
        inputs: Map<String, Value>,
        mode: Mode,
    ) -> Result<RunReport, EngineError> {
        self.run_with_cancel(workflow, inputs, mode, CancelHandle::new())
    }

    /// Executes a workflow that can be cancelled through `cancel`.
    pub fn run_with_cancel(
        &self,
        workflow: &WorkflowDefinition,
        inputs: Map<String, Value>,
        mode: Mode,
        cancel: CancelHandle,
    ) -> Result<RunReport, EngineError> {
        let mut report = validate(workflow);
        if self.config.strict {
            report = report.strict();
        }
        if !report.is_valid() {
            return Err(EngineError::Validation(report));
        }
        for warning in &report.warnings {
            debug!("{}", warning);
        }

        if mode.is_dry_run() && !workflow.execution_config.dry_run_supported {
            warn!(
                "Workflow '{}' does not declare dry run support; simulating anyway",
                workflow.metadata.workflow_id
            );
        }

        let inputs = resolve_inputs(&workflow.inputs, &inputs).map_err(EngineError::InvalidInputs)?;

        let mut ctx = ExecutionContext::new(&workflow.metadata.workflow_id, inputs, mode).with_cancel(cancel);
        if let Some(env) = &self.env {
            ctx = ctx.with_env(env.clone());
        }

        info!(
            "Starting workflow '{}' (trace {}, max parallel: {}, dry run: {})",
            workflow.metadata.workflow_id,
            ctx.trace_id(),
            self.config.max_parallel,
            mode.is_dry_run()
        );

        Ok(self.execute(workflow, &ctx)?.report)
    }

    fn execute(&self, workflow: &WorkflowDefinition, ctx: &ExecutionContext) -> Result<Execution, EngineError> {
        let started = Instant::now();
        let config = &workflow.execution_config;
        let dry_run = ctx.mode().is_dry_run();

        let mut state = RunState::Initialized;
        let mut event = self.event(workflow, ctx, EventKind::RunStarted);
        if workflow.observability.audit.log_inputs {
            let inputs = Value::Object(ctx.inputs().clone());
            event = event.with_detail("inputs", redact(&inputs, &workflow.security.pii_fields));
        }
        self.sink.emit(&event);

        state = self.transition(workflow, ctx, state, RunState::Planning);
        let plan = build_plan(&workflow.steps, config.parallel)?;
        info!(
            "Execution plan: {} step(s) in {} batch(es)",
            plan.len(),
            plan.batches.len()
        );

        let bucket;
        let limiter: &dyn RateLimit = match (&self.limiter, &workflow.security.rate_limit) {
            (Some(shared), _) => shared.as_ref(),
            (None, Some(spec)) => {
                bucket = TokenBucket::from_spec(spec);
                &bucket
            }
            (None, None) => &Unlimited,
        };

        let runner = StepRunner {
            workflow,
            executor: self.executor.as_ref(),
            limiter,
            credentials: self.credentials.as_deref(),
            sub_workflows: Some(self as &dyn SubWorkflowRunner),
            sink: self.sink.as_ref(),
            rate_limit_cap: self.config.rate_limit_retry_cap,
        };

        state = self.transition(workflow, ctx, state, RunState::Running);
        let mut log = RunLog::default();

        if let Err(e) = self.authenticate(workflow, ctx) {
            log.fail(e);
        }

        if log.failure.is_none() {
            let subject = json!({ "inputs": ctx.inputs() });
            for condition in &workflow.validation.pre_conditions {
                if let Err(e) = self.check_condition(workflow, condition, "pre", subject.clone(), ctx, limiter, &mut log) {
                    log.fail(e);
                    break;
                }
            }
        }

        if log.failure.is_none() {
            self.run_batches(workflow, &plan, &runner, ctx, limiter, started, &mut log);
        }

        if dry_run {
            for condition in &workflow.validation.post_conditions {
                log.conditions
                    .push(ConditionOutcome::skipped(condition, "post", "dry run: nothing to verify"));
            }
        } else if log.failure.is_none() {
            let subject = ctx.subject();
            for condition in workflow.validation.post_conditions.iter().filter(|c| c.after_step.is_none()) {
                if let Err(e) = self.check_condition(workflow, condition, "post", subject.clone(), ctx, limiter, &mut log) {
                    log.fail(e);
                    break;
                }
            }
        }

        let cancel = ctx.cancel_handle();
        let rollback_allowed = config.rollback_supported && !dry_run && !log.steps.is_empty();
        let mut rollback = Vec::new();
        let final_state = match &log.failure {
            None => RunState::Succeeded,
            Some(_) if cancel.is_cancelled() && !cancel.rollback_requested() => RunState::Cancelled,
            Some(_) if rollback_allowed => RunState::RolledBack,
            Some(_) if cancel.is_cancelled() => RunState::Cancelled,
            Some(_) => RunState::Failed,
        };
        self.transition(workflow, ctx, state, final_state);

        if final_state == RunState::RolledBack {
            if let Some(e) = &log.failure {
                warn!("Run failed ({}); rolling back completed mutations", e);
            }
            rollback = Rollback {
                workflow,
                executor: self.executor.as_ref(),
                limiter,
                sink: self.sink.as_ref(),
            }
            .run(&log.steps, ctx);
            for record in rollback.iter().filter(|r| r.outcome == RollbackOutcome::Succeeded) {
                log.timeline.add_event(&record.step_id, EventType::RolledBack);
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match &log.failure {
            None => info!(
                "Workflow '{}' completed successfully in {} ms",
                workflow.metadata.workflow_id, duration_ms
            ),
            Some(e) => error!(
                "Workflow '{}' ended {}: {}",
                workflow.metadata.workflow_id, final_state, e
            ),
        }

        self.sink.emit(
            &self
                .event(workflow, ctx, EventKind::RunFinished)
                .with_status(final_state.as_str())
                .with_duration(duration_ms),
        );

        let report = RunReport {
            workflow_id: workflow.metadata.workflow_id.clone(),
            trace_id: ctx.trace_id(),
            mode: ctx.mode(),
            state: final_state,
            plan,
            steps: log.steps,
            outputs: ctx.all_outputs(),
            conditions: log.conditions,
            rollback,
            failure: log.failure.as_ref().map(FailureSummary::from),
            duration_ms,
            timeline: log.timeline,
        };

        Ok(Execution {
            report,
            error: log.failure,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_batches(
        &self,
        workflow: &WorkflowDefinition,
        plan: &ExecutionPlan,
        runner: &StepRunner<'_>,
        ctx: &ExecutionContext,
        limiter: &dyn RateLimit,
        started: Instant,
        log: &mut RunLog,
    ) {
        let config = &workflow.execution_config;
        let max_parallel = config
            .max_parallel
            .map_or(self.config.max_parallel, |n| n.min(self.config.max_parallel))
            .max(1);

        for (index, batch) in plan.batches.iter().enumerate() {
            if let Some(stop) = self.should_stop(workflow, ctx, started) {
                log.fail(stop);
                return;
            }
            debug!("Batch {}/{}: {}", index + 1, plan.batches.len(), batch.join(", "));

            let steps: Vec<&Step> = batch.iter().filter_map(|id| workflow.get_step(id)).collect();
            for chunk in steps.chunks(max_parallel) {
                if ctx.cancel_handle().is_cancelled() {
                    log.fail(EngineError::Cancelled);
                    return;
                }

                for StepOutcome { report, error } in self.run_chunk(workflow, runner, chunk, ctx, &mut log.timeline) {
                    log.steps.push(report);
                    if let Some(e) = error {
                        log.fail(e);
                    }
                }
                if log.failure.is_some() {
                    return;
                }
            }

            if ctx.mode().is_dry_run() {
                continue;
            }

            let after_batch = workflow
                .validation
                .post_conditions
                .iter()
                .filter(|c| c.after_step.as_ref().is_some_and(|s| batch.contains(s)));
            for condition in after_batch {
                let step_id = condition.after_step.as_deref().unwrap_or_default();
                if !log.succeeded(step_id) {
                    log.conditions.push(ConditionOutcome::skipped(
                        condition,
                        "post",
                        format!("step '{}' did not succeed", step_id),
                    ));
                    continue;
                }

                let subject = Value::Object(ctx.outputs_of(step_id).unwrap_or_default());
                if let Err(e) = self.check_condition(workflow, condition, "post", subject, ctx, limiter, log) {
                    log.fail(e);
                    return;
                }
            }
        }
    }

    /// Runs up to `max_parallel` steps of one batch and waits for all of them.
    ///
    /// Outcomes are returned in completion order.
    fn run_chunk(
        &self,
        workflow: &WorkflowDefinition,
        runner: &StepRunner<'_>,
        chunk: &[&Step],
        ctx: &ExecutionContext,
        timeline: &mut ExecutionTimeline,
    ) -> Vec<StepOutcome> {
        let (tx, rx): (Sender<StepOutcome>, Receiver<StepOutcome>) = channel();
        let mut outcomes = Vec::with_capacity(chunk.len());

        thread::scope(|scope| {
            for &step in chunk {
                info!("Starting step: {}", step.id);
                timeline.add_event(&step.id, EventType::Started);
                self.sink.emit(
                    &self
                        .event(workflow, ctx, EventKind::StepStarted)
                        .for_step(&step.id)
                        .with_detail("operation", Value::String(step.operation.to_string())),
                );

                let tx = tx.clone();
                scope.spawn(move || {
                    let outcome = runner.execute(step, ctx);
                    if let Err(e) = tx.send(outcome) {
                        error!("Failed to send completion signal: {}", e);
                    }
                });
            }
            drop(tx);

            for outcome in rx.iter() {
                self.record_completion(workflow, &outcome.report, ctx, timeline);
                outcomes.push(outcome);
            }
        });

        outcomes
    }

    fn record_completion(
        &self,
        workflow: &WorkflowDefinition,
        report: &StepReport,
        ctx: &ExecutionContext,
        timeline: &mut ExecutionTimeline,
    ) {
        let (marker, kind) = match report.status {
            StepStatus::Succeeded if report.simulated => (EventType::Simulated, EventKind::StepSimulated),
            StepStatus::Succeeded => (EventType::Completed, EventKind::StepSucceeded),
            StepStatus::Skipped => (EventType::Skipped, EventKind::StepSkipped),
            _ => (EventType::Failed, EventKind::StepFailed),
        };

        match report.status {
            StepStatus::Succeeded => info!("Step '{}' completed successfully", report.step_id),
            StepStatus::Skipped => warn!("Step '{}' skipped", report.step_id),
            _ => error!(
                "Step '{}' failed: {}",
                report.step_id,
                report.error.as_deref().unwrap_or("unknown error")
            ),
        }
        timeline.add_event(&report.step_id, marker);

        let mut event = self
            .event(workflow, ctx, kind)
            .for_step(&report.step_id)
            .with_status(report.status.as_str())
            .with_attempt(report.attempts)
            .with_duration(report.duration_ms);
        if let Some(code) = report.code {
            event = event.with_detail("code", Value::String(code.as_str().to_string()));
        }
        if workflow.observability.audit.log_outputs && report.status == StepStatus::Succeeded {
            if let Some(outputs) = ctx.outputs_of(&report.step_id) {
                event = event.with_detail(
                    "outputs",
                    redact(&Value::Object(outputs), &workflow.security.pii_fields),
                );
            }
        }
        self.sink.emit(&event);
    }

    /// Evaluates one condition and records its outcome.
    ///
    /// Returns an error only for a failing critical condition.
    #[allow(clippy::too_many_arguments)]
    fn check_condition(
        &self,
        workflow: &WorkflowDefinition,
        condition: &Condition,
        phase: &'static str,
        subject: Value,
        ctx: &ExecutionContext,
        limiter: &dyn RateLimit,
        log: &mut RunLog,
    ) -> Result<(), EngineError> {
        let subject = match &condition.query {
            Some(query) => self.run_query(query, ctx, limiter).map_err(|message| EngineError::ConditionFailed {
                condition: condition.id.clone(),
                message: format!("verification query failed: {}", message),
            }),
            None => Ok(subject),
        };

        let verdict = subject.and_then(|subject| {
            condition::evaluate(condition, &subject).map_err(|source| EngineError::ConditionEvaluation {
                condition: condition.id.clone(),
                source,
            })
        });

        let failure = match verdict {
            Ok(true) => None,
            Ok(false) => Some(EngineError::ConditionFailed {
                condition: condition.id.clone(),
                message: condition
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("check '{}' did not hold", condition.check)),
            }),
            Err(e) => Some(e),
        };

        let status = if failure.is_some() { ConditionStatus::Failed } else { ConditionStatus::Passed };
        log.conditions.push(ConditionOutcome {
            condition_id: condition.id.clone(),
            phase,
            status,
            critical: condition.critical,
            message: failure.as_ref().map(ToString::to_string),
        });
        self.sink.emit(
            &self
                .event(workflow, ctx, EventKind::ConditionChecked)
                .with_status(if failure.is_some() { "failed" } else { "passed" })
                .with_detail("condition", Value::String(condition.id.clone()))
                .with_detail("phase", Value::String(phase.to_string())),
        );

        match failure {
            None => {
                debug!("Condition '{}' passed", condition.id);
                Ok(())
            }
            Some(e) if condition.critical => Err(e),
            Some(e) => {
                warn!("Non-critical condition failed: {}", e);
                Ok(())
            }
        }
    }

    /// Issues a condition's read without retries.
    fn run_query(&self, query: &QuerySpec, ctx: &ExecutionContext, limiter: &dyn RateLimit) -> Result<Value, String> {
        let payload = template::resolve(&Value::Object(query.inputs.clone()), ctx).map_err(|e| e.to_string())?;

        limiter.acquire();
        let mut request = ApiRequest::new(Operation::Query, &query.api_endpoint, payload);
        request.credential = ctx.credential();
        self.executor.call(&request).map_err(|e| e.to_string())
    }

    /// Fetches the run credential once when the workflow requires auth.
    fn authenticate(&self, workflow: &WorkflowDefinition, ctx: &ExecutionContext) -> Result<(), EngineError> {
        if !workflow.security.requires_auth() || ctx.credential().is_some() {
            return Ok(());
        }

        let Some(provider) = &self.credentials else {
            warn!(
                "Workflow '{}' requires auth but no credential provider is configured",
                workflow.metadata.workflow_id
            );
            return Ok(());
        };

        let scope = workflow.security.credential_scope.as_deref();
        let credential = provider.get_credential(scope).map_err(EngineError::Credential)?;
        debug!("Credential acquired for scope {:?}", scope);
        ctx.set_credential(credential);
        Ok(())
    }

    fn should_stop(&self, workflow: &WorkflowDefinition, ctx: &ExecutionContext, started: Instant) -> Option<EngineError> {
        if ctx.cancel_handle().is_cancelled() {
            info!("Run cancelled; no further steps will be scheduled");
            return Some(EngineError::Cancelled);
        }

        let seconds = workflow.execution_config.timeout_seconds?;
        if started.elapsed() >= Duration::from_secs(seconds) {
            return Some(EngineError::Timeout(seconds));
        }
        None
    }

    /// Moves the run to `to` and reports the change to the sink.
    fn transition(&self, workflow: &WorkflowDefinition, ctx: &ExecutionContext, from: RunState, to: RunState) -> RunState {
        debug!("Workflow '{}': {} -> {}", workflow.metadata.workflow_id, from, to);
        self.sink.emit(
            &self
                .event(workflow, ctx, EventKind::RunTransition)
                .with_status(to.as_str())
                .with_detail("from", Value::String(from.as_str().to_string()))
                .with_detail("to", Value::String(to.as_str().to_string())),
        );
        to
    }

    fn event(&self, workflow: &WorkflowDefinition, ctx: &ExecutionContext, kind: EventKind) -> TelemetryEvent {
        TelemetryEvent::new(ctx.trace_id(), &workflow.metadata.workflow_id, kind)
    }
}

impl SubWorkflowRunner for Engine {
    fn run_sub_workflow(
        &self,
        workflow_ref: &str,
        inputs: Map<String, Value>,
        parent: &ExecutionContext,
    ) -> Result<SubWorkflowOutput, EngineError> {
        if parent.stack().iter().any(|id| id == workflow_ref) {
            let mut chain = parent.stack().to_vec();
            chain.push(workflow_ref.to_string());
            return Err(EngineError::SubWorkflowCycle { chain });
        }
        if parent.depth() >= self.config.max_workflow_depth {
            return Err(EngineError::SubWorkflowDepth(self.config.max_workflow_depth));
        }

        let workflow = self
            .registry
            .get(workflow_ref)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_ref.to_string()))?;
        let inputs = resolve_inputs(&workflow.inputs, &inputs).map_err(EngineError::InvalidInputs)?;

        info!("Entering sub-workflow '{}' (depth {})", workflow_ref, parent.depth() + 1);
        let child = parent.child(workflow_ref, inputs);
        let execution = self.execute(workflow, &child)?;

        match execution.report.state {
            RunState::Succeeded => Ok(SubWorkflowOutput {
                value: json!({ "steps": child.steps_value() }),
                mutated: execution.report.steps.iter().any(|r| r.mutated),
            }),
            state => {
                warn!("Sub-workflow '{}' ended {}", workflow_ref, state);
                Err(execution.error.unwrap_or(EngineError::Cancelled))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::client::{ApiError, StaticCredentials};
    use crate::execution::fixture::FixtureExecutor;
    use crate::monitoring::telemetry::{MemorySink, REDACTED};
    use crate::workflow::model::{ErrorHandling, RollbackOperation};
    use crate::workflow::validator::IssueKind;

    const PROMOTION: &str = r#"
metadata:
  workflow_name: create_promotion
  workflow_id: test.create_promotion
  platform: test
  schema_version: 1.0.0
  idempotent: false
inputs:
  required:
    promotion_name:
      type: string
      description: Display name
security:
  auth_required: false
  rate_limit:
    max_requests: 100
steps:
  - id: create
    operation: mutation
    api_endpoint: createPromotion
    inputs:
      name: "{{inputs.promotion_name}}"
    outputs:
      promotion_id: $.createPromotion.id
    rollback_operation:
      api_endpoint: deletePromotion
      inputs:
        id: "{{steps.create.outputs.promotion_id}}"
  - id: add_condition
    operation: mutation
    api_endpoint: addCondition
    depends_on: [create]
    inputs:
      promotion_id: "{{steps.create.outputs.promotion_id}}"
    outputs:
      condition_id: $.id
  - id: add_action
    operation: mutation
    api_endpoint: addAction
    depends_on: [create]
    inputs:
      promotion_id: "{{steps.create.outputs.promotion_id}}"
    outputs:
      action_id: $.id
execution_config:
  parallel: true
  rollback_supported: true
  dry_run_supported: true
  retry_policy:
    initial_backoff_ms: 1
    max_backoff_ms: 5
"#;

    const CHAIN: &str = r#"
metadata:
  workflow_name: chain
  workflow_id: test.chain
  platform: test
  schema_version: 1.0.0
  idempotent: false
security:
  auth_required: false
steps:
  - id: a
    operation: mutation
    api_endpoint: createA
    outputs: { id: $.id }
    rollback_operation:
      api_endpoint: deleteA
      inputs: { id: "{{steps.a.outputs.id}}" }
  - id: b
    operation: mutation
    api_endpoint: createB
    depends_on: [a]
    outputs: { id: $.id }
    rollback_operation:
      api_endpoint: deleteB
      inputs: { id: "{{steps.b.outputs.id}}" }
  - id: c
    operation: mutation
    api_endpoint: createC
    depends_on: [b]
    outputs: { id: $.id }
    rollback_operation:
      api_endpoint: deleteC
      inputs: { id: "{{steps.c.outputs.id}}" }
execution_config:
  rollback_supported: true
"#;

    const INNER: &str = r#"
metadata:
  workflow_name: inner_create
  workflow_id: test.inner
  platform: test
  schema_version: 1.0.0
  idempotent: false
inputs:
  required:
    promotion_name: { type: string, description: Name }
security:
  auth_required: false
steps:
  - id: create
    operation: mutation
    api_endpoint: createPromotion
    inputs: { name: "{{inputs.promotion_name}}" }
    outputs: { promotion_id: $.createPromotion.id }
"#;

    const OUTER: &str = r#"
metadata:
  workflow_name: outer
  workflow_id: test.outer
  platform: test
  schema_version: 1.0.0
  idempotent: false
inputs:
  required:
    name: { type: string, description: Name }
security:
  auth_required: false
steps:
  - id: nested
    operation: workflow
    workflow_ref: test.inner
    inputs: { promotion_name: "{{inputs.name}}" }
    outputs: { promotion_id: $.steps.create.outputs.promotion_id }
"#;

    fn workflow(yaml: &str) -> WorkflowDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn summer() -> Map<String, Value> {
        inputs(json!({ "promotion_name": "Summer" }))
    }

    fn engine(fixture: &Arc<FixtureExecutor>) -> (Engine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let mut engine = Engine::new(Arc::clone(fixture) as Arc<dyn ApiExecutor>);
        engine.set_sink(Arc::clone(&sink) as Arc<dyn EventSink>);
        engine.set_env(HashMap::new());
        (engine, sink)
    }

    fn promotion_fixture() -> FixtureExecutor {
        FixtureExecutor::new()
            .with_response("createPromotion", json!({ "createPromotion": { "id": "p-1" } }))
            .with_response("addCondition", json!({ "id": "c-1" }))
            .with_response("addAction", json!({ "id": "a-1" }))
            .with_response("deletePromotion", json!({ "ok": true }))
    }

    fn position(fixture: &FixtureExecutor, endpoint: &str) -> usize {
        fixture.calls().iter().position(|c| c.endpoint == endpoint).unwrap()
    }

    #[test]
    fn test_end_to_end_parallel_batches() {
        let fixture = Arc::new(promotion_fixture());
        let (engine, sink) = engine(&fixture);

        let report = engine.run(&workflow(PROMOTION), summer(), Mode::Normal).unwrap();

        assert_eq!(report.state, RunState::Succeeded);
        assert_eq!(
            report.plan.batches,
            vec![vec!["create".to_string()], vec!["add_condition".to_string(), "add_action".to_string()]]
        );
        assert_eq!(report.outputs.len(), 3);
        assert_eq!(report.outputs["create"]["promotion_id"], json!("p-1"));
        assert_eq!(report.outputs["add_action"]["action_id"], json!("a-1"));
        assert_eq!(fixture.call_count(), 3);

        let calls = fixture.calls();
        let add_action = calls.iter().find(|c| c.endpoint == "addAction").unwrap();
        assert_eq!(add_action.payload, json!({ "promotion_id": "p-1" }));
        assert_eq!(position(&fixture, "createPromotion"), 0);

        assert_eq!(sink.of_kind(EventKind::StepSucceeded).len(), 3);
        assert_eq!(sink.of_kind(EventKind::RunFinished)[0].status.as_deref(), Some("succeeded"));
        assert!(sink.events().iter().all(|e| e.trace_id == report.trace_id));
    }

    #[test]
    fn test_max_parallel_one_still_completes() {
        let fixture = Arc::new(promotion_fixture());
        let (mut engine, _) = engine(&fixture);
        engine.set_max_parallel(1);

        let report = engine.run(&workflow(PROMOTION), summer(), Mode::Normal).unwrap();
        assert!(report.is_success());
        assert_eq!(report.steps.len(), 3);
    }

    #[test]
    fn test_failure_rolls_back_in_reverse_order() {
        let fixture = Arc::new(
            FixtureExecutor::new()
                .with_response("createA", json!({ "id": "a-1" }))
                .with_response("createB", json!({ "id": "b-1" }))
                .with_error("createC", ApiError::new(ErrorCode::InvalidRequest, "bad payload"))
                .with_error("deleteB", ApiError::new(ErrorCode::Transient, "unavailable"))
                .with_response("deleteA", json!({ "ok": true })),
        );
        let (engine, _) = engine(&fixture);

        let report = engine.run(&workflow(CHAIN), Map::new(), Mode::Normal).unwrap();

        assert_eq!(report.state, RunState::RolledBack);
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step_id.as_deref(), Some("c"));
        assert_eq!(failure.code, Some(ErrorCode::InvalidRequest));
        assert_eq!(failure.attempts, Some(1));

        let rollback: Vec<(&str, &str)> = report
            .rollback
            .iter()
            .map(|r| (r.step_id.as_str(), r.outcome.as_str()))
            .collect();
        assert_eq!(rollback, vec![("c", "skipped"), ("b", "failed"), ("a", "succeeded")]);

        assert!(position(&fixture, "deleteB") < position(&fixture, "deleteA"));
        assert_eq!(fixture.calls_to("deleteC"), 0);
        assert_eq!(report.timeline.steps_with(EventType::RolledBack), vec!["a"]);
    }

    fn chain_failure_fixture() -> FixtureExecutor {
        FixtureExecutor::new()
            .with_response("createA", json!({ "id": "a-1" }))
            .with_response("createB", json!({ "id": "b-1" }))
            .with_error("createC", ApiError::new(ErrorCode::InvalidRequest, "bad payload"))
            .with_response("deleteB", json!({ "ok": true }))
            .with_response("deleteA", json!({ "ok": true }))
    }

    fn transitions(sink: &MemorySink) -> Vec<(String, String)> {
        sink.of_kind(EventKind::RunTransition)
            .into_iter()
            .map(|e| {
                let details = e.details.unwrap_or_default();
                (details["from"].as_str().unwrap().to_string(), details["to"].as_str().unwrap().to_string())
            })
            .collect()
    }

    #[test]
    fn test_run_transitions_emitted() {
        let fixture = Arc::new(promotion_fixture());
        let (engine, sink) = engine(&fixture);
        engine.run(&workflow(PROMOTION), summer(), Mode::Normal).unwrap();

        let pairs = |list: &[(&str, &str)]| -> Vec<(String, String)> {
            list.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
        };
        assert_eq!(
            transitions(&sink),
            pairs(&[("initialized", "planning"), ("planning", "running"), ("running", "succeeded")])
        );

        let fixture = Arc::new(chain_failure_fixture());
        let (engine, sink) = self::engine(&fixture);
        let report = engine.run(&workflow(CHAIN), Map::new(), Mode::Normal).unwrap();
        assert_eq!(report.state, RunState::RolledBack);
        assert_eq!(
            transitions(&sink),
            pairs(&[("initialized", "planning"), ("planning", "running"), ("running", "rolled_back")])
        );

        let events = sink.events();
        let entered = events
            .iter()
            .position(|e| e.event == EventKind::RunTransition && e.status.as_deref() == Some("rolled_back"))
            .unwrap();
        let first_inverse = events.iter().position(|e| e.event == EventKind::RollbackStep).unwrap();
        assert!(entered < first_inverse);
    }

    #[test]
    fn test_fallback_mutation_rolled_back_with_its_own_inverse() {
        let mut wf = workflow(PROMOTION);
        wf.steps.truncate(1);
        wf.steps[0].error_handling = Some(
            ErrorHandling::default().with_fallback(
                Step::new("create_legacy", Operation::Mutation, "createLegacy")
                    .with_input("name", json!("{{inputs.promotion_name}}"))
                    .with_output("promotion_id", "$.id")
                    .with_rollback(
                        RollbackOperation::new("deleteLegacy")
                            .with_input("id", json!("{{steps.create.outputs.promotion_id}}")),
                    ),
            ),
        );
        wf.validation
            .post_conditions
            .push(Condition::new("id_matches", "$.promotion_id == \"nope\"").after("create"));
        let fixture = Arc::new(
            FixtureExecutor::new()
                .with_error("createPromotion", ApiError::new(ErrorCode::InvalidRequest, "unsupported"))
                .with_response("createLegacy", json!({ "id": "l-1" }))
                .with_response("deleteLegacy", json!({ "ok": true }))
                .with_response("deletePromotion", json!({ "ok": true })),
        );
        let (engine, _) = engine(&fixture);

        let report = engine.run(&wf, summer(), Mode::Normal).unwrap();

        assert_eq!(report.state, RunState::RolledBack);
        assert!(report.step("create").unwrap().used_fallback);
        assert_eq!(fixture.calls_to("deleteLegacy"), 1);
        assert_eq!(fixture.calls_to("deletePromotion"), 0);
        let delete = fixture.calls().into_iter().find(|c| c.endpoint == "deleteLegacy").unwrap();
        assert_eq!(delete.payload, json!({ "id": "l-1" }));
    }

    #[test]
    fn test_failure_without_rollback_support() {
        let fixture = Arc::new(FixtureExecutor::new().with_error("createA", ApiError::new(ErrorCode::Forbidden, "no")));
        let (engine, _) = engine(&fixture);
        let mut chain = workflow(CHAIN);
        chain.execution_config.rollback_supported = false;

        let report = engine.run(&chain, Map::new(), Mode::Normal).unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert!(report.rollback.is_empty());
        assert_eq!(report.steps.len(), 1);
        assert_eq!(fixture.calls_to("createB"), 0);
    }

    #[test]
    fn test_dry_run_calls_only_queries() {
        let mut wf = workflow(PROMOTION);
        wf.steps.truncate(1);
        wf.steps.insert(
            0,
            Step::new("lookup", Operation::Query, "promotions").with_output("total", "$.total"),
        );
        wf.steps[1].depends_on.push("lookup".into());

        let fixture = Arc::new(FixtureExecutor::new().with_response("promotions", json!({ "total": 0 })));
        let (engine, sink) = engine(&fixture);

        let report = engine.run(&wf, summer(), Mode::DryRun).unwrap();

        assert_eq!(report.state, RunState::Succeeded);
        assert_eq!(fixture.call_count(), 1);
        assert_eq!(fixture.calls()[0].endpoint, "promotions");
        assert!(report.step("create").unwrap().simulated);
        assert!(report.outputs["create"]["promotion_id"]
            .as_str()
            .unwrap()
            .starts_with("mock_promotion_id_"));
        assert_eq!(sink.of_kind(EventKind::StepSimulated).len(), 1);
    }

    #[test]
    fn test_dry_run_never_rolls_back() {
        let mut wf = workflow(PROMOTION);
        wf.steps.push(
            Step::new("verify", Operation::Query, "promotion")
                .depends_on("create")
                .with_input("id", json!("{{steps.create.outputs.promotion_id}}"))
                .with_output("state", "$.state"),
        );
        let fixture = Arc::new(FixtureExecutor::new().with_error("promotion", ApiError::new(ErrorCode::Forbidden, "no")));
        let (engine, _) = engine(&fixture);

        let report = engine.run(&wf, summer(), Mode::DryRun).unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert!(report.rollback.is_empty());
        assert_eq!(fixture.calls_to("deletePromotion"), 0);
    }

    #[test]
    fn test_cycle_rejected_before_any_call() {
        let mut wf = workflow(CHAIN);
        wf.steps[0].depends_on.push("c".into());
        let fixture = Arc::new(FixtureExecutor::new().lenient());
        let (engine, _) = engine(&fixture);

        match engine.run(&wf, Map::new(), Mode::Normal) {
            Err(EngineError::Validation(report)) => assert!(report.has_error(IssueKind::CyclicDependency)),
            other => panic!("expected validation error, got {:?}", other.map(|r| r.state)),
        }
        assert_eq!(fixture.call_count(), 0);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let fixture = Arc::new(promotion_fixture());
        let (engine, _) = engine(&fixture);

        let err = engine.run(&workflow(PROMOTION), Map::new(), Mode::Normal).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInputs(_)));
        assert_eq!(fixture.call_count(), 0);
    }

    #[test]
    fn test_duplicate_recovered_through_lookup() {
        let mut wf = workflow(PROMOTION);
        wf.steps.truncate(1);
        wf.steps[0].error_handling = Some(ErrorHandling::default().fetch_existing(
            QuerySpec::new("promotions")
                .with_input("name", json!("{{inputs.promotion_name}}"))
                .with_output("promotion_id", "$.items[0].id"),
        ));
        let fixture = Arc::new(
            FixtureExecutor::new()
                .with_error("createPromotion", ApiError::new(ErrorCode::Duplicate, "already exists"))
                .with_response("promotions", json!({ "items": [{ "id": "p-existing" }] })),
        );
        let (engine, _) = engine(&fixture);

        let report = engine.run(&wf, summer(), Mode::Normal).unwrap();
        assert!(report.is_success());
        assert_eq!(report.outputs["create"]["promotion_id"], json!("p-existing"));
        let step = report.step("create").unwrap();
        assert!(step.duplicate_recovered);
        assert!(!step.mutated);
    }

    #[test]
    fn test_pre_condition_blocks_run() {
        let mut wf = workflow(PROMOTION);
        wf.validation.pre_conditions.push(
            Condition::new("name_free", "$.items is empty")
                .with_query(QuerySpec::new("promotions").with_input("name", json!("{{inputs.promotion_name}}"))),
        );
        let fixture = Arc::new(promotion_fixture().with_response("promotions", json!({ "items": [{ "id": "x" }] })));
        let (engine, _) = engine(&fixture);

        let report = engine.run(&wf, summer(), Mode::Normal).unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.conditions[0].status, ConditionStatus::Failed);
        assert!(report.steps.is_empty());
        assert_eq!(fixture.call_count(), 1);
    }

    #[test]
    fn test_pre_condition_against_inputs() {
        let mut wf = workflow(PROMOTION);
        wf.validation
            .pre_conditions
            .push(Condition::new("has_name", "$.inputs.promotion_name is not empty"));
        let fixture = Arc::new(promotion_fixture());
        let (engine, _) = engine(&fixture);

        let report = engine.run(&wf, summer(), Mode::Normal).unwrap();
        assert!(report.is_success());
        assert_eq!(report.conditions[0].status, ConditionStatus::Passed);
    }

    #[test]
    fn test_post_condition_after_step_triggers_rollback() {
        let mut wf = workflow(PROMOTION);
        wf.validation
            .post_conditions
            .push(Condition::new("id_matches", "$.promotion_id == \"p-2\"").after("create"));
        let fixture = Arc::new(promotion_fixture());
        let (engine, _) = engine(&fixture);

        let report = engine.run(&wf, summer(), Mode::Normal).unwrap();
        assert_eq!(report.state, RunState::RolledBack);
        assert_eq!(fixture.calls_to("addCondition"), 0);
        assert_eq!(fixture.calls_to("deletePromotion"), 1);
        let delete = fixture.calls().into_iter().find(|c| c.endpoint == "deletePromotion").unwrap();
        assert_eq!(delete.payload, json!({ "id": "p-1" }));
    }

    #[test]
    fn test_non_critical_post_condition_only_warns() {
        let mut wf = workflow(PROMOTION);
        wf.validation
            .post_conditions
            .push(Condition::new("has_flag", "$.steps.create.outputs.enabled == true").non_critical());
        let fixture = Arc::new(promotion_fixture());
        let (engine, _) = engine(&fixture);

        let report = engine.run(&wf, summer(), Mode::Normal).unwrap();
        assert!(report.is_success());
        assert_eq!(report.conditions[0].status, ConditionStatus::Failed);
    }

    #[test]
    fn test_post_conditions_skipped_in_dry_run() {
        let mut wf = workflow(PROMOTION);
        wf.validation
            .post_conditions
            .push(Condition::new("created", "$.promotion_id exists").after("create"));
        let fixture = Arc::new(promotion_fixture());
        let (engine, _) = engine(&fixture);

        let report = engine.run(&wf, summer(), Mode::DryRun).unwrap();
        assert!(report.is_success());
        assert_eq!(report.conditions[0].status, ConditionStatus::Skipped);
    }

    #[test]
    fn test_cancelled_before_start() {
        let fixture = Arc::new(promotion_fixture());
        let (engine, _) = engine(&fixture);
        let cancel = CancelHandle::new();
        cancel.cancel();

        let report = engine
            .run_with_cancel(&workflow(PROMOTION), summer(), Mode::Normal, cancel)
            .unwrap();
        assert_eq!(report.state, RunState::Cancelled);
        assert_eq!(fixture.call_count(), 0);
    }

    /// Cancels the run from inside the first call.
    struct CancellingExecutor {
        inner: FixtureExecutor,
        cancel: CancelHandle,
        rollback: bool,
    }

    impl ApiExecutor for CancellingExecutor {
        fn call(&self, request: &ApiRequest) -> Result<Value, ApiError> {
            if request.endpoint == "createA" {
                if self.rollback {
                    self.cancel.cancel_with_rollback();
                } else {
                    self.cancel.cancel();
                }
            }
            self.inner.call(request)
        }
    }

    fn cancel_mid_run(rollback: bool) -> (RunReport, Arc<CancellingExecutor>) {
        let cancel = CancelHandle::new();
        let executor = Arc::new(CancellingExecutor {
            inner: FixtureExecutor::new()
                .with_response("createA", json!({ "id": "a-1" }))
                .with_response("deleteA", json!({})),
            cancel: cancel.clone(),
            rollback,
        });
        let engine = Engine::new(Arc::clone(&executor) as Arc<dyn ApiExecutor>);
        let report = engine
            .run_with_cancel(&workflow(CHAIN), Map::new(), Mode::Normal, cancel)
            .unwrap();
        (report, executor)
    }

    #[test]
    fn test_cancel_mid_run_stops_scheduling() {
        let (report, executor) = cancel_mid_run(false);
        assert_eq!(report.state, RunState::Cancelled);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(executor.inner.calls_to("createB"), 0);
        assert_eq!(executor.inner.calls_to("deleteA"), 0);
    }

    #[test]
    fn test_cancel_with_rollback() {
        let (report, executor) = cancel_mid_run(true);
        assert_eq!(report.state, RunState::RolledBack);
        assert_eq!(executor.inner.calls_to("deleteA"), 1);
    }

    #[test]
    fn test_run_timeout_checked_between_batches() {
        let fixture = Arc::new(
            FixtureExecutor::new()
                .with_response("createA", json!({ "id": "a-1" }))
                .with_latency(Duration::from_millis(1100)),
        );
        let (engine, _) = engine(&fixture);
        let mut chain = workflow(CHAIN);
        chain.execution_config.timeout_seconds = Some(1);
        chain.execution_config.rollback_supported = false;

        let report = engine.run(&chain, Map::new(), Mode::Normal).unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert!(report.failure.unwrap().message.contains("timeout"));
        assert_eq!(fixture.calls_to("createB"), 0);
    }

    #[test]
    fn test_sub_workflow_outputs() {
        let fixture = Arc::new(promotion_fixture());
        let (mut engine, _) = engine(&fixture);
        engine.register_workflow(workflow(INNER)).unwrap();
        assert!(engine.is_registered("test.inner"));

        let report = engine
            .run(&workflow(OUTER), inputs(json!({ "name": "Nested" })), Mode::Normal)
            .unwrap();
        assert!(report.is_success(), "{:?}", report.failure);
        assert_eq!(report.outputs["nested"]["promotion_id"], json!("p-1"));
        assert_eq!(fixture.calls()[0].payload, json!({ "name": "Nested" }));
    }

    #[test]
    fn test_sub_workflow_step_rolled_back() {
        let fixture = Arc::new(
            promotion_fixture().with_error("createBoom", ApiError::new(ErrorCode::InvalidRequest, "rejected")),
        );
        let (mut engine, _) = engine(&fixture);
        engine.register_workflow(workflow(INNER)).unwrap();

        let mut outer = workflow(OUTER);
        outer.steps[0].rollback_operation = Some(
            RollbackOperation::new("deletePromotion").with_input("id", json!("{{steps.nested.outputs.promotion_id}}")),
        );
        outer.steps.push(Step::new("boom", Operation::Mutation, "createBoom").depends_on("nested"));
        outer.execution_config.rollback_supported = true;

        let report = engine.run(&outer, inputs(json!({ "name": "Nested" })), Mode::Normal).unwrap();

        assert_eq!(report.state, RunState::RolledBack);
        assert!(report.step("nested").unwrap().mutated);
        assert_eq!(fixture.calls_to("deletePromotion"), 1);
        let delete = fixture.calls().into_iter().find(|c| c.endpoint == "deletePromotion").unwrap();
        assert_eq!(delete.payload, json!({ "id": "p-1" }));

        let rollback: Vec<(&str, &str)> = report
            .rollback
            .iter()
            .map(|r| (r.step_id.as_str(), r.outcome.as_str()))
            .collect();
        assert_eq!(rollback, vec![("boom", "skipped"), ("nested", "succeeded")]);
    }

    #[test]
    fn test_sub_workflow_cycle_detected() {
        let fixture = Arc::new(promotion_fixture());
        let (mut engine, _) = engine(&fixture);
        let looping = OUTER.replace("workflow_ref: test.inner", "workflow_ref: test.outer");
        engine.register_workflow(workflow(&looping)).unwrap();

        let report = engine
            .run(&workflow(&looping), inputs(json!({ "name": "Loop" })), Mode::Normal)
            .unwrap();
        assert_eq!(report.state, RunState::Failed);
        let message = report.failure.unwrap().message;
        assert!(message.contains("sub-workflow cycle: test.outer -> test.outer"), "{}", message);
        assert_eq!(fixture.call_count(), 0);
    }

    #[test]
    fn test_unknown_sub_workflow() {
        let fixture = Arc::new(promotion_fixture());
        let (engine, _) = engine(&fixture);

        let report = engine
            .run(&workflow(OUTER), inputs(json!({ "name": "x" })), Mode::Normal)
            .unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert!(report.failure.unwrap().message.contains("unknown workflow 'test.inner'"));
    }

    #[test]
    fn test_credential_fetched_once_for_auth() {
        let mut wf = workflow(PROMOTION);
        wf.security.auth_required = Some(true);
        wf.security.secrets_handling = Some(crate::workflow::model::SecretsHandling::RuntimeInjected);
        let fixture = Arc::new(promotion_fixture());
        let (mut engine, _) = engine(&fixture);
        engine.set_credentials(Arc::new(StaticCredentials::new("token-1")));

        let report = engine.run(&wf, summer(), Mode::Normal).unwrap();
        assert!(report.is_success());
        assert!(fixture.calls().iter().all(|c| c.credential.as_deref() == Some("token-1")));
    }

    #[test]
    fn test_telemetry_redacts_pii() {
        let mut wf = workflow(PROMOTION);
        wf.observability.audit.log_inputs = true;
        wf.observability.audit.log_outputs = true;
        wf.security.pii_fields = vec!["promotion_name".into(), "promotion_id".into()];
        let fixture = Arc::new(promotion_fixture());
        let (engine, sink) = engine(&fixture);

        engine.run(&wf, summer(), Mode::Normal).unwrap();

        let started = &sink.of_kind(EventKind::RunStarted)[0];
        assert_eq!(started.details.as_ref().unwrap()["inputs"]["promotion_name"], json!(REDACTED));

        let create = sink
            .of_kind(EventKind::StepSucceeded)
            .into_iter()
            .find(|e| e.step_id.as_deref() == Some("create"))
            .unwrap();
        assert_eq!(create.details.unwrap()["outputs"]["promotion_id"], json!(REDACTED));
    }

    #[test]
    fn test_report_serializes() {
        let fixture = Arc::new(promotion_fixture());
        let (engine, _) = engine(&fixture);

        let report = engine.run(&workflow(PROMOTION), summer(), Mode::Normal).unwrap();
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["state"], json!("succeeded"));
        assert_eq!(value["steps"].as_array().unwrap().len(), 3);
        assert!(value.get("failure").is_none());
    }
}
