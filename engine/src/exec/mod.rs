//! Deployment execution: event fan-out and slot orchestration

pub mod events;
pub mod orchestrator;

pub use events::EventSink;
pub use orchestrator::{CancelOutcome, Orchestrator, StartOutcome};
