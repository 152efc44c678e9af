//! Deployment record and log persistence
//!
//! The engine only depends on these interfaces; the relational
//! implementation lives with the platform backend. The in-memory
//! implementation here backs tests and local mode.

pub mod memory;
pub mod settings;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::models::deployment::{Deployment, DeploymentStatus, LogEntry};

/// Durable store of deployment records
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new (pending) deployment record
    async fn insert(&self, deployment: Deployment) -> Result<(), EngineError>;

    /// Fetch a deployment by id
    async fn get(&self, id: &str) -> Result<Deployment, EngineError>;

    /// Transition a deployment into `running`.
    ///
    /// Sets `started_at` exactly once, on the first pending -> running edge.
    /// Fails with an invalid-transition error if the deployment is running
    /// or in a non-retryable terminal state.
    async fn mark_running(&self, id: &str) -> Result<Deployment, EngineError>;

    /// Transition a deployment into a terminal status, setting
    /// `completed_at` exactly once and recording the output summary.
    async fn mark_terminal(
        &self,
        id: &str,
        status: DeploymentStatus,
        output: Option<String>,
    ) -> Result<Deployment, EngineError>;
}

/// Append-only store of structured log entries.
///
/// Entries are immutable once written and listed in write order; each
/// append is individually durable so live tails see committed lines.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append one entry
    async fn append(&self, entry: LogEntry) -> Result<(), EngineError>;

    /// List all entries for a deployment in write order
    async fn list(&self, deployment_id: &str) -> Result<Vec<LogEntry>, EngineError>;
}
