//! Server state

use std::sync::Arc;

use crate::exec::orchestrator::Orchestrator;
use crate::storage::{DeploymentStore, LogStore};

/// Server state shared across handlers
pub struct ServerState {
    pub store: Arc<dyn DeploymentStore>,
    pub logs: Arc<dyn LogStore>,
    pub orchestrator: Orchestrator,
}

impl ServerState {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        logs: Arc<dyn LogStore>,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            store,
            logs,
            orchestrator,
        }
    }
}
