//! Execution orchestration
//!
//! One execution slot per running deployment, keyed by deployment id.
//! Starting is idempotent: a second start while a slot exists is a no-op.
//! Only the supervised task that owns a slot removes it, and that task is
//! the single writer of the terminal status and the final `complete`
//! message, so every outcome path converges there.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::EngineError;
use crate::exec::events::EventSink;
use crate::models::deployment::{Deployment, DeploymentStatus, LogEntry};
use crate::models::message::{CompletionStatus, EventType, StreamMessage};
use crate::platform::PlatformServices;
use crate::provision::runner::ProcessHandle;
use crate::provision::workflow::Provisioner;
use crate::storage::settings::Settings;
use crate::storage::{DeploymentStore, LogStore};

/// Outcome of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelling,
    NotRunning,
}

/// Why a running deployment was aborted
#[derive(Debug, Clone)]
enum AbortReason {
    Cancelled,
    Disconnected(String),
}

/// Live state of one running deployment
struct ExecutionSlot {
    cancel: CancellationToken,
    process: Arc<ProcessHandle>,
    sink: Arc<EventSink>,
    abort_reason: Arc<StdMutex<Option<AbortReason>>>,
}

/// Registry of execution slots and supervisor of deployment tasks
#[derive(Clone)]
pub struct Orchestrator {
    slots: Arc<RwLock<HashMap<String, ExecutionSlot>>>,
    store: Arc<dyn DeploymentStore>,
    logs: Arc<dyn LogStore>,
    platform: PlatformServices,
    settings: Arc<Settings>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        logs: Arc<dyn LogStore>,
        platform: PlatformServices,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            store,
            logs,
            platform,
            settings,
        }
    }

    /// Start a deployment as a supervised background task.
    ///
    /// At most one slot exists per id: a start while running is a no-op.
    /// Fails if the record is missing or in a non-retryable terminal state.
    pub async fn start(&self, id: &str) -> Result<StartOutcome, EngineError> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(id) {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let deployment = self.store.mark_running(id).await?;

        // Sequence numbering continues any earlier attempt's transcript.
        let persisted = self.logs.list(id).await?.len() as u64;
        let sink = Arc::new(EventSink::new(
            id,
            self.logs.clone(),
            self.settings.max_message_bytes,
            persisted,
        ));

        let slot = ExecutionSlot {
            cancel: CancellationToken::new(),
            process: Arc::new(ProcessHandle::new()),
            sink: sink.clone(),
            abort_reason: Arc::new(StdMutex::new(None)),
        };
        let cancel = slot.cancel.clone();
        let process = slot.process.clone();
        let abort_reason = slot.abort_reason.clone();
        slots.insert(id.to_string(), slot);
        drop(slots);

        info!(deployment_id = %id, name = %deployment.name, "Starting deployment");
        let this = self.clone();
        tokio::spawn(async move {
            this.supervise(deployment, sink, cancel, process, abort_reason)
                .await;
        });

        Ok(StartOutcome::Started)
    }

    /// Request cancellation of a running deployment.
    ///
    /// Safe to call for an id with no slot. For a live slot the underlying
    /// process is signaled before this returns; full teardown completes
    /// asynchronously in the supervised task.
    pub async fn cancel(&self, id: &str) -> CancelOutcome {
        let slots = self.slots.read().await;
        match slots.get(id) {
            Some(slot) => {
                slot.set_abort_reason(AbortReason::Cancelled);
                slot.cancel.cancel();
                slot.process.signal_term();
                info!(deployment_id = %id, "Cancellation requested");
                CancelOutcome::Cancelling
            }
            None => CancelOutcome::NotRunning,
        }
    }

    /// Abort a running deployment because its sole observer disconnected.
    ///
    /// Distinct from an explicit cancel: the deployment ends `failed` with
    /// an explanatory output.
    pub async fn handle_disconnect(&self, id: &str) {
        let slots = self.slots.read().await;
        if let Some(slot) = slots.get(id) {
            slot.set_abort_reason(AbortReason::Disconnected(
                "observing client disconnected during execution".to_string(),
            ));
            slot.cancel.cancel();
            slot.process.signal_term();
            warn!(deployment_id = %id, "Observer disconnected, aborting deployment");
        }
    }

    /// Attach a live observer to a running deployment
    pub async fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<LogEntry>> {
        self.slots.read().await.get(id).map(|s| s.sink.subscribe())
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.slots.read().await.contains_key(id)
    }

    /// Cancel every running deployment and wait for the slots to drain
    pub async fn shutdown(&self, max_wait: Duration) {
        {
            let slots = self.slots.read().await;
            if slots.is_empty() {
                return;
            }
            info!("Shutting down {} running deployment(s)", slots.len());
            for slot in slots.values() {
                slot.set_abort_reason(AbortReason::Cancelled);
                slot.cancel.cancel();
                slot.process.signal_term();
            }
        }

        let deadline = tokio::time::Instant::now() + max_wait;
        while !self.slots.read().await.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!("Shutdown deadline reached with slots still draining");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Supervised body of one deployment run. Sole writer of the terminal
    /// status and the only place the slot is removed.
    async fn supervise(
        &self,
        deployment: Deployment,
        sink: Arc<EventSink>,
        cancel: CancellationToken,
        process: Arc<ProcessHandle>,
        abort_reason: Arc<StdMutex<Option<AbortReason>>>,
    ) {
        let id = deployment.id.clone();

        sink.emit(StreamMessage::new(
            EventType::Start,
            format!("Starting deployment {}", deployment.name),
        ))
        .await;

        let provisioner = Provisioner::new(
            deployment,
            self.settings.clone(),
            self.platform.clone(),
            sink.clone(),
            process,
            cancel.clone(),
        );

        let result = tokio::select! {
            result = provisioner.run() => result,
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        };

        let (status, completion, return_code, output) = match result {
            Ok(code) => (
                DeploymentStatus::Success,
                CompletionStatus::Success,
                code,
                "Deployment completed successfully".to_string(),
            ),
            Err(EngineError::Cancelled) => {
                let reason = abort_reason
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                match reason {
                    Some(AbortReason::Disconnected(message)) => {
                        (DeploymentStatus::Failed, CompletionStatus::Error, -1, message)
                    }
                    _ => (
                        DeploymentStatus::Cancelled,
                        CompletionStatus::Error,
                        -1,
                        "Deployment cancelled".to_string(),
                    ),
                }
            }
            Err(e) => (
                DeploymentStatus::Failed,
                CompletionStatus::Error,
                -1,
                e.to_string(),
            ),
        };

        // Observers see the error before the terminal complete message.
        if completion == CompletionStatus::Error {
            sink.emit(StreamMessage::new(EventType::Error, output.clone()))
                .await;
        }
        sink.emit(StreamMessage::complete(completion, return_code, output.clone()))
            .await;

        if let Err(e) = self
            .store
            .mark_terminal(&id, status, Some(output))
            .await
        {
            error!(deployment_id = %id, "Failed to record terminal status: {}", e);
        }
        info!(deployment_id = %id, ?status, "Deployment finished");

        self.slots.write().await.remove(&id);
    }
}

impl ExecutionSlot {
    /// First abort reason wins; an explicit cancel is never downgraded to
    /// a disconnect.
    fn set_abort_reason(&self, reason: AbortReason) {
        let mut guard = self.abort_reason.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::deployment::Deployment;
    use crate::models::template::TemplateRef;
    use crate::platform::memory::{MemoryCi, MemoryCluster, MemoryGitHost};
    use crate::storage::memory::{MemoryDeploymentStore, MemoryLogStore};
    use crate::storage::settings::AutomationSettings;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Settings pointing the automation tool at shell scripts in temp dirs
    fn shell_settings(render_script: &str) -> (Settings, Vec<TempDir>) {
        let secrets = tempfile::tempdir().unwrap();
        std::fs::write(secrets.path().join("kubeconfig"), "kc").unwrap();
        std::fs::write(secrets.path().join("registry-token"), "rt").unwrap();

        let playbooks = tempfile::tempdir().unwrap();
        std::fs::write(playbooks.path().join("render.yml"), render_script).unwrap();
        std::fs::write(playbooks.path().join("migrations.yml"), "exit 0\n").unwrap();

        let settings = Settings {
            automation: AutomationSettings {
                command: "sh".to_string(),
                playbook_dir: playbooks.path().to_path_buf(),
                secrets_dir: secrets.path().to_path_buf(),
                kill_grace: 1,
                ..AutomationSettings::default()
            },
            ..Settings::default()
        };
        (settings, vec![secrets, playbooks])
    }

    fn harness(settings: Settings) -> (Orchestrator, Arc<MemoryDeploymentStore>) {
        let store = Arc::new(MemoryDeploymentStore::new());
        let logs = Arc::new(MemoryLogStore::new());
        let platform = PlatformServices {
            cluster: Arc::new(MemoryCluster::new()),
            githost: Arc::new(MemoryGitHost::new()),
            ci: Arc::new(MemoryCi::idle()),
        };
        let orchestrator = Orchestrator::new(store.clone(), logs, platform, Arc::new(settings));
        (orchestrator, store)
    }

    fn deployment_with_namespace() -> Deployment {
        let mut variables = HashMap::new();
        variables.insert("namespace".to_string(), serde_json::json!("shop-ns"));
        Deployment::new("shop", TemplateRef::new("fastapi-postgres"), variables, "alice")
    }

    async fn wait_terminal(store: &MemoryDeploymentStore, id: &str) -> Deployment {
        for _ in 0..200 {
            let deployment = store.get(id).await.unwrap();
            if deployment.status.is_terminal() {
                return deployment;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("deployment {} never reached a terminal status", id);
    }

    #[tokio::test]
    async fn test_start_unknown_deployment_errors() {
        let (orchestrator, _) = harness(Settings::default());
        let err = orchestrator.start("no-such-id").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_without_slot_is_not_running() {
        let (orchestrator, _) = harness(Settings::default());
        assert_eq!(orchestrator.cancel("no-such-id").await, CancelOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_double_start_is_idempotent_and_cancel_lands() {
        let (settings, _dirs) = shell_settings("sleep 30\n");
        let (orchestrator, store) = harness(settings);

        let deployment = deployment_with_namespace();
        let id = deployment.id.clone();
        store.insert(deployment).await.unwrap();

        assert_eq!(orchestrator.start(&id).await.unwrap(), StartOutcome::Started);
        assert_eq!(
            orchestrator.start(&id).await.unwrap(),
            StartOutcome::AlreadyRunning
        );
        assert!(orchestrator.is_running(&id).await);

        assert_eq!(orchestrator.cancel(&id).await, CancelOutcome::Cancelling);

        let done = wait_terminal(&store, &id).await;
        assert_eq!(done.status, DeploymentStatus::Cancelled);
        assert!(!orchestrator.is_running(&id).await);
    }

    #[tokio::test]
    async fn test_validation_failure_marks_failed() {
        let (orchestrator, store) = harness(Settings::default());

        // No namespace variable: phase 1 validation fails.
        let deployment = Deployment::new(
            "shop",
            TemplateRef::new("fastapi-postgres"),
            HashMap::new(),
            "alice",
        );
        let id = deployment.id.clone();
        store.insert(deployment).await.unwrap();

        orchestrator.start(&id).await.unwrap();
        let done = wait_terminal(&store, &id).await;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert!(done.output.unwrap().contains("namespace"));
        assert!(!orchestrator.is_running(&id).await);
    }

    #[tokio::test]
    async fn test_disconnect_marks_failed_with_explanation() {
        let (settings, _dirs) = shell_settings("sleep 30\n");
        let (orchestrator, store) = harness(settings);

        let deployment = deployment_with_namespace();
        let id = deployment.id.clone();
        store.insert(deployment).await.unwrap();

        orchestrator.start(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.handle_disconnect(&id).await;

        let done = wait_terminal(&store, &id).await;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert!(done.output.unwrap().contains("disconnected"));
        assert!(!orchestrator.is_running(&id).await);
    }

    #[tokio::test]
    async fn test_shutdown_drains_slots() {
        let (settings, _dirs) = shell_settings("sleep 30\n");
        let (orchestrator, store) = harness(settings);

        let deployment = deployment_with_namespace();
        let id = deployment.id.clone();
        store.insert(deployment).await.unwrap();
        orchestrator.start(&id).await.unwrap();

        orchestrator.shutdown(Duration::from_secs(10)).await;
        assert!(!orchestrator.is_running(&id).await);
        let done = store.get(&id).await.unwrap();
        assert!(done.status.is_terminal());
    }
}
