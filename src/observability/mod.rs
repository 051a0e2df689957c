//! Observability for the reconfiguration agent and rebuild
//!
//! - Structured JSON logging with deterministic field order
//! - A catalogue of named events
//! - Lock-free counters
//!
//! Logging is synchronous and has no side effects on the state machines:
//! a failed write is ignored.
//!
//! ```ignore
//! use fabric_ra::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::ReconfigurationStart, &[("stage", "Phase1GetLsn")]);
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

/// Log an event at its catalogued severity.
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log an event with fields at its catalogued severity.
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}
