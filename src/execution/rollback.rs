//! Best-effort compensation of completed mutations.
//!
//! Rollback walks the steps that mutated external state in reverse
//! completion order and invokes each step's inverse operation. A failing
//! inverse is logged and the sequence moves on; nothing is retried.

use log::{error, info, warn};
use serde::Serialize;
use serde_json::Value;

use super::client::{ApiExecutor, ApiRequest};
use super::context::ExecutionContext;
use super::rate_limit::RateLimit;
use super::step::{StepReport, StepStatus};
use crate::monitoring::telemetry::{EventKind, EventSink, TelemetryEvent};
use crate::workflow::model::{RollbackOperation, WorkflowDefinition};
use crate::workflow::template;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// Nothing to undo
    Skipped(String),
    Succeeded,
    /// The inverse call failed; the entity may be left behind
    Failed(String),
}

impl RollbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped(_) => "skipped",
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackRecord {
    pub step_id: String,
    #[serde(flatten)]
    pub outcome: RollbackOutcome,
}

pub struct Rollback<'a> {
    pub workflow: &'a WorkflowDefinition,
    pub executor: &'a dyn ApiExecutor,
    pub limiter: &'a dyn RateLimit,
    pub sink: &'a dyn EventSink,
}

impl<'a> Rollback<'a> {
    /// Compensates the run described by `reports`, which must be in
    /// completion order.
    pub fn run(&self, reports: &[StepReport], ctx: &ExecutionContext) -> Vec<RollbackRecord> {
        let mut records = Vec::new();

        for report in reports {
            let is_mutation = self
                .workflow
                .get_step(&report.step_id)
                .map(|s| s.operation.has_side_effects())
                .unwrap_or(false);
            if report.status == StepStatus::Failed && is_mutation && !report.mutated {
                records.push(self.record(ctx, &report.step_id, RollbackOutcome::Skipped("never mutated".into())));
            }
        }

        let mutated: Vec<&StepReport> = reports.iter().filter(|r| r.mutated).collect();
        info!("Rolling back {} mutated step(s)", mutated.len());

        for report in mutated.into_iter().rev() {
            let outcome = self.invert(report, ctx);
            records.push(self.record(ctx, &report.step_id, outcome));
        }

        records
    }

    /// Picks the inverse of whatever actually ran: a fallback's own inverse
    /// wins over the primary step's.
    fn inverse_of(&self, report: &StepReport) -> Option<&'a RollbackOperation> {
        let step = self.workflow.get_step(&report.step_id)?;
        let fallback = step
            .error_handling
            .as_ref()
            .and_then(|h| h.fallback.as_deref())
            .filter(|_| report.used_fallback)
            .and_then(|f| f.rollback_operation.as_ref());
        fallback.or(step.rollback_operation.as_ref())
    }

    fn invert(&self, report: &StepReport, ctx: &ExecutionContext) -> RollbackOutcome {
        let step_id = report.step_id.as_str();
        let Some(inverse) = self.inverse_of(report) else {
            warn!("Step '{}' has no rollback operation; its changes remain", step_id);
            return RollbackOutcome::Skipped("no rollback operation".into());
        };

        let payload = match template::resolve(&Value::Object(inverse.inputs.clone()), ctx) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Rollback of step '{}' failed: {}", step_id, e);
                return RollbackOutcome::Failed(e.to_string());
            }
        };

        self.limiter.acquire();
        let mut request = ApiRequest::new(inverse.operation, &inverse.api_endpoint, payload);
        request.credential = ctx.credential();

        match self.executor.call(&request) {
            Ok(_) => {
                info!("Rolled back step '{}' via {}", step_id, inverse.api_endpoint);
                RollbackOutcome::Succeeded
            }
            Err(e) => {
                error!("Rollback of step '{}' failed: {}", step_id, e);
                RollbackOutcome::Failed(e.to_string())
            }
        }
    }

    fn record(&self, ctx: &ExecutionContext, step_id: &str, outcome: RollbackOutcome) -> RollbackRecord {
        let mut event = TelemetryEvent::new(ctx.trace_id(), &self.workflow.metadata.workflow_id, EventKind::RollbackStep)
            .for_step(step_id)
            .with_status(outcome.as_str());
        if let RollbackOutcome::Skipped(reason) | RollbackOutcome::Failed(reason) = &outcome {
            event = event.with_detail("reason", Value::String(reason.clone()));
        }
        self.sink.emit(&event);

        RollbackRecord {
            step_id: step_id.to_string(),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::client::{ApiError, ErrorCode};
    use crate::execution::context::Mode;
    use crate::execution::fixture::FixtureExecutor;
    use crate::execution::rate_limit::Unlimited;
    use crate::monitoring::telemetry::MemorySink;
    use crate::workflow::model::{ErrorHandling, Operation, Step};
    use serde_json::{json, Map};

    fn mutation(id: &str) -> Step {
        Step::new(id, Operation::Mutation, format!("create_{}", id))
            .with_output("id", "$.id")
            .with_rollback(RollbackOperation::new(format!("delete_{}", id)).with_input("id", json!(format!("{{{{steps.{}.outputs.id}}}}", id))))
    }

    fn report(id: &str, status: StepStatus, mutated: bool) -> StepReport {
        let mut report = StepReport::pending(id);
        report.status = status;
        report.mutated = mutated;
        report
    }

    fn ctx_with_outputs(ids: &[&str]) -> ExecutionContext {
        let ctx = ExecutionContext::new("wf", Map::new(), Mode::Normal);
        for id in ids {
            let outputs = json!({ "id": format!("{}-1", id) }).as_object().cloned().unwrap();
            ctx.record_outputs(id, outputs);
        }
        ctx
    }

    #[test]
    fn test_reverse_order_continues_past_failure() {
        let workflow = WorkflowDefinition::new("wf", "test.rollback", "test")
            .with_step(mutation("a"))
            .with_step(mutation("b").depends_on("a"))
            .with_step(mutation("c").depends_on("b"));
        let fixture = FixtureExecutor::new()
            .with_response("delete_a", json!({ "ok": true }))
            .with_error("delete_b", ApiError::new(ErrorCode::Transient, "unavailable"));
        let sink = MemorySink::new();
        let rollback = Rollback {
            workflow: &workflow,
            executor: &fixture,
            limiter: &Unlimited,
            sink: &sink,
        };

        let reports = vec![
            report("a", StepStatus::Succeeded, true),
            report("b", StepStatus::Succeeded, true),
            report("c", StepStatus::Failed, false),
        ];
        let records = rollback.run(&reports, &ctx_with_outputs(&["a", "b"]));

        let summary: Vec<(&str, &str)> = records.iter().map(|r| (r.step_id.as_str(), r.outcome.as_str())).collect();
        assert_eq!(summary, vec![("c", "skipped"), ("b", "failed"), ("a", "succeeded")]);

        let calls = fixture.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].endpoint, "delete_b");
        assert_eq!(calls[1].endpoint, "delete_a");
        assert_eq!(calls[1].payload, json!({ "id": "a-1" }));
        assert_eq!(calls[1].operation, Operation::Mutation);
        assert_eq!(sink.of_kind(EventKind::RollbackStep).len(), 3);
    }

    #[test]
    fn test_unmutated_steps_not_inverted() {
        let workflow = WorkflowDefinition::new("wf", "test.rollback", "test")
            .with_step(mutation("a"))
            .with_step(Step::new("lookup", Operation::Query, "find").with_output("id", "$.id"));
        let fixture = FixtureExecutor::new().lenient();
        let sink = MemorySink::new();
        let rollback = Rollback {
            workflow: &workflow,
            executor: &fixture,
            limiter: &Unlimited,
            sink: &sink,
        };

        let mut recovered = report("a", StepStatus::Succeeded, false);
        recovered.duplicate_recovered = true;
        let reports = vec![recovered, report("lookup", StepStatus::Failed, false)];

        assert!(rollback.run(&reports, &ctx_with_outputs(&["a"])).is_empty());
        assert_eq!(fixture.call_count(), 0);
    }

    #[test]
    fn test_missing_inverse_is_skipped() {
        let workflow = WorkflowDefinition::new("wf", "test.rollback", "test")
            .with_step(Step::new("a", Operation::Mutation, "create").with_output("id", "$.id"));
        let fixture = FixtureExecutor::new();
        let sink = MemorySink::new();
        let rollback = Rollback {
            workflow: &workflow,
            executor: &fixture,
            limiter: &Unlimited,
            sink: &sink,
        };

        let records = rollback.run(&[report("a", StepStatus::Succeeded, true)], &ctx_with_outputs(&["a"]));
        assert_eq!(records[0].outcome, RollbackOutcome::Skipped("no rollback operation".into()));
    }

    #[test]
    fn test_fallback_inverse_preferred() {
        let legacy = |inverse: bool| {
            let step = Step::new("a_legacy", Operation::Mutation, "create_legacy").with_output("id", "$.id");
            if inverse {
                step.with_rollback(RollbackOperation::new("delete_legacy").with_input("id", json!("{{steps.a.outputs.id}}")))
            } else {
                step
            }
        };
        let fixture = FixtureExecutor::new().lenient();
        let sink = MemorySink::new();

        let mut recovered = report("a", StepStatus::Succeeded, true);
        recovered.used_fallback = true;

        for (inverse, expected) in [(true, "delete_legacy"), (false, "delete_a")] {
            let workflow = WorkflowDefinition::new("wf", "test.rollback", "test")
                .with_step(mutation("a").with_error_handling(ErrorHandling::default().with_fallback(legacy(inverse))));
            let rollback = Rollback {
                workflow: &workflow,
                executor: &fixture,
                limiter: &Unlimited,
                sink: &sink,
            };

            let records = rollback.run(std::slice::from_ref(&recovered), &ctx_with_outputs(&["a"]));
            assert_eq!(records[0].outcome, RollbackOutcome::Succeeded);
            assert_eq!(fixture.calls().last().unwrap().endpoint, expected);
        }
        assert_eq!(fixture.calls_to("delete_legacy"), 1);
        assert_eq!(fixture.calls()[0].payload, json!({ "id": "a-1" }));
    }
}
