//! Per-run execution context.
//!
//! Holds everything a run accumulates: resolved inputs, the write-once
//! step outputs map, the skipped set, the environment snapshot, the
//! sub-workflow frame stack and the run credential. A context is owned by
//! exactly one run; the workflow definition it executes is shared.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::workflow::template::ReferenceSource;

/// Slice used when sleeping so cancellation is noticed promptly.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    /// Reads are performed, writes are simulated
    DryRun,
}

impl Mode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, Self::DryRun)
    }
}

/// Shared cancellation flags for a run.
///
/// In-flight calls finish; no new step or retry is scheduled once
/// cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    rollback: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Cancels and asks for completed mutations to be rolled back.
    pub fn cancel_with_rollback(&self) {
        self.rollback.store(true, Ordering::SeqCst);
        self.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn rollback_requested(&self) -> bool {
        self.rollback.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns false when the sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
        }
    }
}

pub struct ExecutionContext {
    trace_id: Uuid,
    mode: Mode,
    inputs: Map<String, Value>,
    outputs: DashMap<String, Map<String, Value>>,
    skipped: DashSet<String>,
    env: Arc<HashMap<String, String>>,
    stack: Vec<String>,
    cancel: CancelHandle,
    credential: Arc<RwLock<Option<String>>>,
}

impl ExecutionContext {
    /// Creates a context with a fresh trace id and a snapshot of the
    /// process environment.
    pub fn new(workflow_id: impl Into<String>, inputs: Map<String, Value>, mode: Mode) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            mode,
            inputs,
            outputs: DashMap::new(),
            skipped: DashSet::new(),
            env: Arc::new(std::env::vars().collect()),
            stack: vec![workflow_id.into()],
            cancel: CancelHandle::new(),
            credential: Arc::new(RwLock::new(None)),
        }
    }

    /// Replaces the environment snapshot.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Context for a nested workflow frame.
    ///
    /// Shares the trace id, mode, environment, cancellation and credential
    /// with the parent but starts with empty outputs.
    pub fn child(&self, workflow_id: &str, inputs: Map<String, Value>) -> Self {
        let mut stack = self.stack.clone();
        stack.push(workflow_id.to_string());
        Self {
            trace_id: self.trace_id,
            mode: self.mode,
            inputs,
            outputs: DashMap::new(),
            skipped: DashSet::new(),
            env: Arc::clone(&self.env),
            stack,
            cancel: self.cancel.clone(),
            credential: Arc::clone(&self.credential),
        }
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    /// Workflow ids from the root run down to this frame.
    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn credential(&self) -> Option<String> {
        self.credential.read().ok().and_then(|c| c.clone())
    }

    pub fn set_credential(&self, credential: String) {
        if let Ok(mut slot) = self.credential.write() {
            *slot = Some(credential);
        }
    }

    /// Records a step's outputs. Returns false if the step already has
    /// outputs; the first write wins.
    pub fn record_outputs(&self, step_id: &str, outputs: Map<String, Value>) -> bool {
        match self.outputs.entry(step_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(outputs);
                true
            }
        }
    }

    pub fn outputs_of(&self, step_id: &str) -> Option<Map<String, Value>> {
        self.outputs.get(step_id).map(|o| o.value().clone())
    }

    pub fn has_outputs(&self, step_id: &str) -> bool {
        self.outputs.contains_key(step_id)
    }

    pub fn mark_skipped(&self, step_id: &str) {
        self.skipped.insert(step_id.to_string());
    }

    pub fn is_skipped(&self, step_id: &str) -> bool {
        self.skipped.contains(step_id)
    }

    /// All recorded outputs, ordered by step id.
    pub fn all_outputs(&self) -> BTreeMap<String, Map<String, Value>> {
        self.outputs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// `{"<id>": {"outputs": {...}}}` for every recorded step.
    pub fn steps_value(&self) -> Value {
        let steps: Map<String, Value> = self
            .all_outputs()
            .into_iter()
            .map(|(id, outputs)| {
                let mut entry = Map::new();
                entry.insert("outputs".to_string(), Value::Object(outputs));
                (id, Value::Object(entry))
            })
            .collect();
        Value::Object(steps)
    }

    /// Subject for conditions that look at the whole run.
    pub fn subject(&self) -> Value {
        let mut subject = Map::new();
        subject.insert("inputs".to_string(), Value::Object(self.inputs.clone()));
        subject.insert("steps".to_string(), self.steps_value());
        Value::Object(subject)
    }
}

impl ReferenceSource for ExecutionContext {
    fn input(&self, name: &str) -> Option<Value> {
        self.inputs.get(name).cloned()
    }

    fn step_output(&self, step_id: &str, name: &str) -> Option<Value> {
        self.outputs.get(step_id).and_then(|o| o.get(name).cloned())
    }

    fn env(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }
}
