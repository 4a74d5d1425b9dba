//! Structured telemetry events.
//!
//! One [`TelemetryEvent`] is emitted per run transition and per step
//! transition. Sinks are injected; [`LogSink`] forwards events to the `log`
//! facade as JSON and [`MemorySink`] keeps them for inspection.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Placeholder written in place of PII values.
pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunTransition,
    RunFinished,
    StepStarted,
    StepSucceeded,
    StepFailed,
    StepSkipped,
    StepSimulated,
    StepRetried,
    ConditionChecked,
    RollbackStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub trace_id: Uuid,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TelemetryEvent {
    pub fn new(trace_id: Uuid, workflow_id: impl Into<String>, event: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            trace_id,
            workflow_id: workflow_id.into(),
            step_id: None,
            event,
            duration_ms: None,
            status: None,
            attempt: None,
            details: None,
        }
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Adds a detail entry, creating the details object on first use.
    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        let details = self.details.get_or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = details {
            map.insert(key.to_string(), value);
        }
        self
    }
}

/// Receives telemetry events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent);
}

/// Writes events to the `log` facade under the `opflow::telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &TelemetryEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "opflow::telemetry", "{}", json),
            Err(e) => log::warn!("Failed to serialize telemetry event: {}", e),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<TelemetryEvent> {
        self.events().into_iter().filter(|e| e.event == kind).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Replaces the values of PII fields, at any depth, with [`REDACTED`].
///
/// Field names match case-insensitively.
pub fn redact(value: &Value, pii_fields: &[String]) -> Value {
    if pii_fields.is_empty() {
        return value.clone();
    }

    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    let sensitive = pii_fields.iter().any(|f| f.eq_ignore_ascii_case(key));
                    let item = if sensitive {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(item, pii_fields)
                    };
                    (key.clone(), item)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|i| redact(i, pii_fields)).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redact_nested() {
        let pii = vec!["email".to_string(), "Phone".to_string()];
        let value = json!({
            "customer": { "EMAIL": "a@b.c", "name": "Ann" },
            "contacts": [{ "phone": "123" }],
            "email_verified": true
        });

        assert_eq!(
            redact(&value, &pii),
            json!({
                "customer": { "EMAIL": REDACTED, "name": "Ann" },
                "contacts": [{ "phone": REDACTED }],
                "email_verified": true
            })
        );
    }

    #[test]
    fn test_event_builder_and_serialization() {
        let trace = Uuid::new_v4();
        let event = TelemetryEvent::new(trace, "wf", EventKind::StepSucceeded)
            .for_step("create")
            .with_duration(12)
            .with_attempt(2)
            .with_status("succeeded")
            .with_detail("outputs", json!({ "id": 1 }));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], json!("step_succeeded"));
        assert_eq!(json["step_id"], json!("create"));
        assert_eq!(json["details"]["outputs"]["id"], json!(1));
        assert_eq!(json["trace_id"], json!(trace.to_string()));
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        let trace = Uuid::new_v4();
        sink.emit(&TelemetryEvent::new(trace, "wf", EventKind::RunStarted));
        sink.emit(&TelemetryEvent::new(trace, "wf", EventKind::StepStarted).for_step("a"));

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.of_kind(EventKind::StepStarted).len(), 1);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_log_sink_does_not_panic() {
        LogSink.emit(&TelemetryEvent::new(Uuid::new_v4(), "wf", EventKind::RunFinished));
    }
}
