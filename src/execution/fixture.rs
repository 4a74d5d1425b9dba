//! Replaying collaborator.
//!
//! [`FixtureExecutor`] answers calls from recorded responses keyed by
//! endpoint. Each endpoint holds a queue; responses are consumed in order
//! and the last one repeats. Every call is recorded for inspection.
//!
//! Fixture file format:
//!
//! ```json
//! {
//!   "createPromotion": [
//!     { "error": { "code": "duplicate", "message": "already exists" } }
//!   ],
//!   "promotions": { "response": { "items": [{ "id": "p-1" }] } }
//! }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::debug;
use serde::Deserialize;
use serde_json::Value;

use super::client::{ApiError, ApiExecutor, ApiRequest, ErrorCode};
use crate::error::EngineError;
use crate::workflow::model::Operation;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureResponse {
    Response(Value),
    Error(ApiError),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FixtureEntry {
    Many(Vec<FixtureResponse>),
    One(FixtureResponse),
}

/// A call observed by the fixture executor.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub operation: Operation,
    pub endpoint: String,
    pub payload: Value,
    pub credential: Option<String>,
}

#[derive(Default)]
pub struct FixtureExecutor {
    responses: Mutex<HashMap<String, VecDeque<FixtureResponse>>>,
    calls: Mutex<Vec<RecordedCall>>,
    rejected_credentials: HashSet<String>,
    latency: Option<Duration>,
    lenient: bool,
}

impl FixtureExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads responses from a JSON fixture file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: HashMap<String, FixtureEntry> =
            serde_json::from_str(&content).map_err(|e| EngineError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        let mut executor = Self::new();
        for (endpoint, entry) in entries {
            let queue = match entry {
                FixtureEntry::Many(list) => list,
                FixtureEntry::One(single) => vec![single],
            };
            executor = executor.with_sequence(endpoint, queue);
        }
        Ok(executor)
    }

    pub fn with_response(self, endpoint: impl Into<String>, response: Value) -> Self {
        self.push(endpoint.into(), FixtureResponse::Response(response))
    }

    pub fn with_error(self, endpoint: impl Into<String>, error: ApiError) -> Self {
        self.push(endpoint.into(), FixtureResponse::Error(error))
    }

    pub fn with_sequence(self, endpoint: impl Into<String>, responses: Vec<FixtureResponse>) -> Self {
        let endpoint = endpoint.into();
        responses.into_iter().fold(self, |acc, r| acc.push(endpoint.clone(), r))
    }

    /// Calls carrying this credential fail with `invalid_credentials`.
    pub fn rejecting_credential(mut self, credential: impl Into<String>) -> Self {
        self.rejected_credentials.insert(credential.into());
        self
    }

    /// Sleeps this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Unknown endpoints answer `{}` instead of `not_found`.
    pub fn lenient(mut self) -> Self {
        self.lenient = true;
        self
    }

    fn push(self, endpoint: String, response: FixtureResponse) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.entry(endpoint).or_default().push_back(response);
        }
        self
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.calls().iter().filter(|c| c.endpoint == endpoint).count()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    fn next_response(&self, endpoint: &str) -> Option<FixtureResponse> {
        let mut responses = self.responses.lock().ok()?;
        let queue = responses.get_mut(endpoint)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl ApiExecutor for FixtureExecutor {
    fn call(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        debug!("Fixture call: {} {}", request.operation, request.endpoint);

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                operation: request.operation,
                endpoint: request.endpoint.clone(),
                payload: request.payload.clone(),
                credential: request.credential.clone(),
            });
        }

        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }

        if let Some(credential) = &request.credential {
            if self.rejected_credentials.contains(credential) {
                return Err(ApiError::new(ErrorCode::InvalidCredentials, "credential rejected"));
            }
        }

        match self.next_response(&request.endpoint) {
            Some(FixtureResponse::Response(value)) => Ok(value),
            Some(FixtureResponse::Error(error)) => Err(error),
            None if self.lenient => Ok(Value::Object(Default::default())),
            None => Err(ApiError::new(
                ErrorCode::NotFound,
                format!("no fixture for endpoint '{}'", request.endpoint),
            )),
        }
    }
}
