//! Monitoring Module
//!
//! Structured telemetry and the per-run execution timeline.
//!
//! # Components
//!
//! - [`EventSink`]: Destination for telemetry events
//! - [`ExecutionTimeline`]: Step start/end timing for Gantt charts

pub mod telemetry;
pub mod timeline;

pub use telemetry::{EventKind, EventSink, LogSink, MemorySink, TelemetryEvent};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
