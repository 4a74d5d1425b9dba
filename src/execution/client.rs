//! API-call collaborator interfaces.
//!
//! The engine never talks to a platform directly. Each step is handed to an
//! injected [`ApiExecutor`], and credentials come from an injected
//! [`CredentialProvider`].

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::workflow::model::Operation;

/// Machine-readable failure category reported by the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The entity already exists
    Duplicate,
    Forbidden,
    InvalidCredentials,
    RateLimited,
    Transient,
    Timeout,
    NotFound,
    InvalidRequest,
    Other,
}

impl ErrorCode {
    /// Whether the retry strategy may try again after this error.
    ///
    /// `forbidden` and `invalid_request` are permanent. Duplicates and
    /// credential failures have their own recovery paths.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Timeout | Self::RateLimited | Self::Other | Self::NotFound)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Forbidden => "forbidden",
            Self::InvalidCredentials => "invalid_credentials",
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::InvalidRequest => "invalid_request",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by a collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            message: "rate limit exceeded".to_string(),
            retry_after_ms: Some(retry_after_ms),
        }
    }
}

/// One call handed to the collaborator.
#[derive(Clone)]
pub struct ApiRequest {
    pub operation: Operation,
    pub endpoint: String,
    pub payload: Value,
    pub credential: Option<String>,
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(operation: Operation, endpoint: impl Into<String>, payload: Value) -> Self {
        Self {
            operation,
            endpoint: endpoint.into(),
            payload,
            credential: None,
            timeout: None,
        }
    }
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("operation", &self.operation)
            .field("endpoint", &self.endpoint)
            .field("payload", &self.payload)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Executes API calls on behalf of the engine.
///
/// Implementations must be shareable across the worker threads of a batch.
pub trait ApiExecutor: Send + Sync {
    fn call(&self, request: &ApiRequest) -> Result<Value, ApiError>;
}

/// Supplies credentials for a security scope.
pub trait CredentialProvider: Send + Sync {
    fn get_credential(&self, scope: Option<&str>) -> Result<String, ApiError>;
}

/// A fixed credential, optionally rotated through a list on each refresh.
pub struct StaticCredentials {
    values: Vec<String>,
    next: Mutex<usize>,
}

impl StaticCredentials {
    pub fn new(credential: impl Into<String>) -> Self {
        Self::rotating(vec![credential.into()])
    }

    /// Hands out each credential in turn, repeating the last one.
    pub fn rotating(values: Vec<String>) -> Self {
        Self {
            values,
            next: Mutex::new(0),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn get_credential(&self, _scope: Option<&str>) -> Result<String, ApiError> {
        let mut next = self
            .next
            .lock()
            .map_err(|_| ApiError::new(ErrorCode::Other, "credential state poisoned"))?;
        let value = self
            .values
            .get(*next)
            .or_else(|| self.values.last())
            .cloned()
            .ok_or_else(|| ApiError::new(ErrorCode::InvalidCredentials, "no credential configured"))?;
        *next += 1;
        Ok(value)
    }
}
