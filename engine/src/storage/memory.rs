//! In-memory deployment and log stores

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::errors::EngineError;
use crate::models::deployment::{Deployment, DeploymentStatus, LogEntry};
use crate::storage::{DeploymentStore, LogStore};

/// In-memory deployment store
#[derive(Default)]
pub struct MemoryDeploymentStore {
    deployments: RwLock<HashMap<String, Deployment>>,
}

impl MemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryDeploymentStore {
    async fn insert(&self, deployment: Deployment) -> Result<(), EngineError> {
        let mut deployments = self.deployments.write().await;
        if deployments.contains_key(&deployment.id) {
            return Err(EngineError::StoreError(format!(
                "deployment {} already exists",
                deployment.id
            )));
        }
        deployments.insert(deployment.id.clone(), deployment);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Deployment, EngineError> {
        let deployments = self.deployments.read().await;
        deployments
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("deployment {}", id)))
    }

    async fn mark_running(&self, id: &str) -> Result<Deployment, EngineError> {
        let mut deployments = self.deployments.write().await;
        let deployment = deployments
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("deployment {}", id)))?;

        if !deployment.status.can_transition(DeploymentStatus::Running) {
            return Err(EngineError::InvalidTransition(format!(
                "{:?} -> running for deployment {}",
                deployment.status, id
            )));
        }

        deployment.status = DeploymentStatus::Running;
        if deployment.started_at.is_none() {
            deployment.started_at = Some(Utc::now());
        }
        // A retry clears the previous attempt's terminal markers.
        deployment.completed_at = None;
        deployment.output = None;

        Ok(deployment.clone())
    }

    async fn mark_terminal(
        &self,
        id: &str,
        status: DeploymentStatus,
        output: Option<String>,
    ) -> Result<Deployment, EngineError> {
        if !status.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "{:?} is not a terminal status",
                status
            )));
        }

        let mut deployments = self.deployments.write().await;
        let deployment = deployments
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("deployment {}", id)))?;

        if !deployment.status.can_transition(status) {
            return Err(EngineError::InvalidTransition(format!(
                "{:?} -> {:?} for deployment {}",
                deployment.status, status, id
            )));
        }

        deployment.status = status;
        if deployment.completed_at.is_none() {
            deployment.completed_at = Some(Utc::now());
        }
        deployment.output = output;

        Ok(deployment.clone())
    }
}

/// In-memory append-only log store
#[derive(Default)]
pub struct MemoryLogStore {
    entries: RwLock<HashMap<String, Vec<LogEntry>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, entry: LogEntry) -> Result<(), EngineError> {
        let mut entries = self.entries.write().await;
        entries
            .entry(entry.deployment_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn list(&self, deployment_id: &str) -> Result<Vec<LogEntry>, EngineError> {
        let entries = self.entries.read().await;
        Ok(entries.get(deployment_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::{EventType, StreamMessage};
    use crate::models::template::TemplateRef;

    fn sample_deployment() -> Deployment {
        Deployment::new(
            "demo-app",
            TemplateRef::new("fastapi-postgres"),
            HashMap::new(),
            "tester",
        )
    }

    #[tokio::test]
    async fn test_started_at_set_once() {
        let store = MemoryDeploymentStore::new();
        let deployment = sample_deployment();
        let id = deployment.id.clone();
        store.insert(deployment).await.unwrap();

        let running = store.mark_running(&id).await.unwrap();
        let first_start = running.started_at.unwrap();

        store
            .mark_terminal(&id, DeploymentStatus::Failed, Some("boom".into()))
            .await
            .unwrap();

        // Retry keeps the original started_at.
        let retried = store.mark_running(&id).await.unwrap();
        assert_eq!(retried.started_at.unwrap(), first_start);
        assert!(retried.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_completed_at_set_once_per_terminal() {
        let store = MemoryDeploymentStore::new();
        let deployment = sample_deployment();
        let id = deployment.id.clone();
        store.insert(deployment).await.unwrap();

        store.mark_running(&id).await.unwrap();
        let done = store
            .mark_terminal(&id, DeploymentStatus::Success, Some("ok".into()))
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.status, DeploymentStatus::Success);

        // A second terminal transition is rejected.
        let err = store
            .mark_terminal(&id, DeploymentStatus::Failed, None)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_no_restart_from_success() {
        let store = MemoryDeploymentStore::new();
        let deployment = sample_deployment();
        let id = deployment.id.clone();
        store.insert(deployment).await.unwrap();

        store.mark_running(&id).await.unwrap();
        store
            .mark_terminal(&id, DeploymentStatus::Success, None)
            .await
            .unwrap();

        assert!(store.mark_running(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_log_entries_in_write_order() {
        let store = MemoryLogStore::new();
        for seq in 0..5 {
            store
                .append(LogEntry::new(
                    "d1",
                    seq,
                    StreamMessage::new(EventType::Output, format!("line {}", seq)),
                ))
                .await
                .unwrap();
        }

        let entries = store.list("d1").await.unwrap();
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.seq, i as u64);
        }
        assert!(store.list("other").await.unwrap().is_empty());
    }
}
