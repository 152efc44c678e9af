//! Main application run loop

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::errors::EngineError;
use crate::exec::orchestrator::Orchestrator;
use crate::platform::ci::ArgoCi;
use crate::platform::githost::GiteaGitHost;
use crate::platform::memory::{MemoryCi, MemoryCluster, MemoryGitHost};
use crate::platform::PlatformServices;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::storage::memory::{MemoryDeploymentStore, MemoryLogStore};
use crate::storage::settings::Settings;
use crate::storage::{DeploymentStore, LogStore};

/// Run the deployment engine
pub async fn run(
    engine_version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), EngineError> {
    info!("Initializing Berth deployment engine...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let settings = Arc::new(options.settings.clone());
    let store: Arc<dyn DeploymentStore> = Arc::new(MemoryDeploymentStore::new());
    let logs: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
    let platform = init_platform(&settings).await;

    let orchestrator = Orchestrator::new(store.clone(), logs.clone(), platform, settings.clone());
    shutdown_manager.with_orchestrator(orchestrator.clone())?;

    // Start the HTTP/WebSocket server
    let state = Arc::new(ServerState::new(store, logs, orchestrator));
    let mut server_shutdown = shutdown_tx.subscribe();
    let server_handle = serve(&settings.server, state, async move {
        let _ = server_shutdown.recv().await;
    })
    .await?;
    shutdown_manager.with_server_handle(server_handle)?;

    info!("Berth deployment engine {} ready", engine_version);

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

/// Build the platform collaborators.
///
/// The git host and CI clients are REST surfaces and get real
/// implementations when their API tokens are mounted; without tokens the
/// engine falls back to in-memory collaborators (local mode). The cluster
/// interface is always backed by the platform's own controller and is
/// in-memory here.
async fn init_platform(settings: &Settings) -> PlatformServices {
    let cluster = Arc::new(MemoryCluster::new());

    let git_token = read_token(&settings.automation.secrets_dir.join("git-token")).await;
    let ci_token = read_token(&settings.automation.secrets_dir.join("ci-token")).await;

    if let (Some(git_token), Some(ci_token)) = (git_token, ci_token) {
        let githost = GiteaGitHost::new(&settings.git.api_base, git_token);
        let ci = ArgoCi::new(&settings.ci.api_base, &settings.ci.namespace, ci_token);
        match (githost, ci) {
            (Ok(githost), Ok(ci)) => {
                info!("Platform API tokens found, using REST collaborators");
                return PlatformServices {
                    cluster,
                    githost: Arc::new(githost),
                    ci: Arc::new(ci),
                };
            }
            _ => warn!("Failed to build REST collaborators, falling back to local mode"),
        }
    } else {
        warn!("Platform API tokens not mounted, running in local mode");
    }

    PlatformServices {
        cluster,
        githost: Arc::new(MemoryGitHost::new()),
        ci: Arc::new(MemoryCi::idle()),
    }
}

async fn read_token(path: &Path) -> Option<SecretString> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => {
            let token = raw.trim();
            if token.is_empty() {
                None
            } else {
                Some(SecretString::from(token.to_string()))
            }
        }
        Err(_) => None,
    }
}

// =============================== SHUTDOWN ================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    orchestrator: Option<Orchestrator>,
    server_handle: Option<JoinHandle<Result<(), EngineError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            orchestrator: None,
            server_handle: None,
        }
    }

    pub fn with_orchestrator(&mut self, orchestrator: Orchestrator) -> Result<(), EngineError> {
        if self.orchestrator.is_some() {
            return Err(EngineError::ShutdownError("orchestrator already set".to_string()));
        }
        self.orchestrator = Some(orchestrator);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), EngineError>>,
    ) -> Result<(), EngineError> {
        if self.server_handle.is_some() {
            return Err(EngineError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), EngineError> {
        info!("Shutting down Berth deployment engine...");

        // 1. Running deployments: cancel and drain
        if let Some(orchestrator) = self.orchestrator.take() {
            orchestrator
                .shutdown(self.lifecycle_options.drain_timeout)
                .await;
        }

        // 2. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| EngineError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
