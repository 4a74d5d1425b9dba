//! Workflow Execution Module
//!
//! Runs validated workflows against an injected API collaborator.
//!
//! # Architecture
//!
//! - [`engine`]: Orchestrates runs batch by batch
//! - [`step`]: Single step execution with retries and recovery
//! - [`rollback`]: Compensation of completed mutations
//! - [`client`]: Collaborator traits and error codes
//! - [`context`]: Per-run state shared by worker threads
//! - [`rate_limit`]: Token bucket limiter
//! - [`retry`]: Backoff policy
//! - [`fixture`]: Canned-response executor for dry runs and tests

pub mod client;
pub mod context;
pub mod engine;
pub mod fixture;
pub mod rate_limit;
pub mod retry;
pub mod rollback;
pub mod step;

pub use client::{ApiError, ApiExecutor, ApiRequest, CredentialProvider, ErrorCode, StaticCredentials};
pub use context::{CancelHandle, ExecutionContext, Mode};
pub use engine::{Engine, RunReport, RunState};
pub use fixture::FixtureExecutor;
pub use rate_limit::{RateLimit, TokenBucket, Unlimited};
pub use step::{StepReport, StepStatus};
