//! Deployment record and log entry models

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::message::StreamMessage;
use crate::models::template::TemplateRef;

/// Status of a deployment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Record exists, not yet started
    Pending,

    /// Exactly one execution slot exists for this deployment
    Running,

    /// Terminal: provisioning finished with a zero result
    Success,

    /// Terminal: non-zero exit, phase error or observer disconnect
    Failed,

    /// Terminal: explicit cancellation
    Cancelled,
}

impl DeploymentStatus {
    /// Whether this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }

    /// Whether a transition to `next` is permitted.
    ///
    /// Transitions are monotonic along the state machine; a failed
    /// deployment may re-enter running (retry), success and cancelled
    /// may not.
    pub fn can_transition(&self, next: DeploymentStatus) -> bool {
        matches!(
            (self, next),
            (DeploymentStatus::Pending, DeploymentStatus::Running)
                | (DeploymentStatus::Failed, DeploymentStatus::Running)
                | (DeploymentStatus::Running, DeploymentStatus::Success)
                | (DeploymentStatus::Running, DeploymentStatus::Failed)
                | (DeploymentStatus::Running, DeploymentStatus::Cancelled)
        )
    }
}

/// One attempt to materialize a template into a running application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique deployment ID
    pub id: String,

    /// Display name of the application
    pub name: String,

    /// Template this deployment was created from
    pub template: TemplateRef,

    /// Current status
    pub status: DeploymentStatus,

    /// Resolved provisioning parameters
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,

    /// Free-text output summary (set on terminal transitions)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Set exactly once, at the pending -> running edge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Set exactly once, on any transition into a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Identity of the creator
    pub created_by: String,
}

impl Deployment {
    /// Create a new pending deployment record
    pub fn new(
        name: impl Into<String>,
        template: TemplateRef,
        variables: HashMap<String, serde_json::Value>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            template,
            status: DeploymentStatus::Pending,
            variables,
            output: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            created_by: created_by.into(),
        }
    }

    /// Look up a string-valued variable
    pub fn variable(&self, key: &str) -> Option<&str> {
        self.variables.get(key).and_then(|v| v.as_str())
    }
}

/// One line of structured progress, append-only per deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Owning deployment ID
    pub deployment_id: String,

    /// Monotonic per-deployment sequence number
    pub seq: u64,

    /// Server-assigned timestamp
    pub timestamp: DateTime<Utc>,

    /// The streamed message this entry mirrors
    #[serde(flatten)]
    pub message: StreamMessage,
}

impl LogEntry {
    pub fn new(deployment_id: impl Into<String>, seq: u64, message: StreamMessage) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            seq,
            timestamp: Utc::now(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use DeploymentStatus::*;

        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Success));
        assert!(Running.can_transition(Failed));
        assert!(Running.can_transition(Cancelled));
        assert!(Failed.can_transition(Running));

        // No exit from success or cancelled.
        assert!(!Success.can_transition(Running));
        assert!(!Cancelled.can_transition(Running));
        // No skipping pending -> terminal.
        assert!(!Pending.can_transition(Success));
        assert!(!Pending.can_transition(Failed));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(DeploymentStatus::Success.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(DeploymentStatus::Cancelled.is_terminal());
        assert!(!DeploymentStatus::Pending.is_terminal());
        assert!(!DeploymentStatus::Running.is_terminal());
    }
}
