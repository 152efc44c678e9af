//! WebSocket streaming scenarios against a live in-process server

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempDir;
use tokio_tungstenite::tungstenite::Message;

use berthd::exec::orchestrator::Orchestrator;
use berthd::models::deployment::{Deployment, DeploymentStatus};
use berthd::models::template::TemplateRef;
use berthd::platform::memory::{MemoryCi, MemoryCluster, MemoryGitHost};
use berthd::platform::{BuildNode, BuildPhase, BuildStatus, CiApi, PlatformServices, SecretMaterial};
use berthd::server::serve::router;
use berthd::server::state::ServerState;
use berthd::storage::memory::{MemoryDeploymentStore, MemoryLogStore};
use berthd::storage::settings::{AutomationSettings, CiSettings, Settings};
use berthd::storage::{DeploymentStore, LogStore};

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<MemoryDeploymentStore>,
    logs: Arc<MemoryLogStore>,
    addr: std::net::SocketAddr,
    _dirs: Vec<TempDir>,
}

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
        ci: CiSettings {
            trigger_timeout: 5,
            poll_interval: 0,
            ..CiSettings::default()
        },
        ..Settings::default()
    };
    (settings, vec![secrets, playbooks])
}

async fn seed_platform_secrets(cluster: &MemoryCluster, settings: &Settings) {
    let ns = settings.platform_namespace.as_str();
    for name in [
        "platform-tls",
        "registry-credentials",
        "admin-credentials",
        "object-store-credentials",
        "gitops-credentials",
    ] {
        cluster
            .seed_secret(ns, name, SecretMaterial::from_pairs([("value", name)]))
            .await;
    }
    cluster
        .seed_secret(ns, "git-credentials", SecretMaterial::from_pairs([("token", "tok")]))
        .await;
    cluster
        .seed_secret(
            &settings.ci.namespace,
            "ci-token",
            SecretMaterial::from_pairs([("token", "ci")]),
        )
        .await;
}

async fn harness(render_script: &str, ci: Arc<dyn CiApi>) -> Harness {
    let (settings, dirs) = shell_settings(render_script);
    let settings = Arc::new(settings);

    let cluster = Arc::new(MemoryCluster::new());
    seed_platform_secrets(&cluster, &settings).await;

    let store = Arc::new(MemoryDeploymentStore::new());
    let logs = Arc::new(MemoryLogStore::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        logs.clone(),
        PlatformServices {
            cluster,
            githost: Arc::new(MemoryGitHost::new()),
            ci,
        },
        settings,
    );

    let state = Arc::new(ServerState::new(
        store.clone(),
        logs.clone(),
        orchestrator.clone(),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    Harness {
        orchestrator,
        store,
        logs,
        addr,
        _dirs: dirs,
    }
}

fn shop_deployment() -> Deployment {
    let mut variables = HashMap::new();
    variables.insert("namespace".to_string(), serde_json::json!("shop-ns"));
    variables.insert("domain".to_string(), serde_json::json!("apps.berth.dev"));
    Deployment::new("shop", TemplateRef::new("fastapi-postgres"), variables, "alice")
}

fn running_build() -> BuildStatus {
    BuildStatus {
        name: "build-shop-1".to_string(),
        phase: BuildPhase::Running,
        message: None,
        nodes: vec![BuildNode {
            id: "n1".to_string(),
            display_name: "compile".to_string(),
            phase: BuildPhase::Running,
        }],
    }
}

fn succeeded_build() -> BuildStatus {
    BuildStatus {
        name: "build-shop-1".to_string(),
        phase: BuildPhase::Succeeded,
        message: None,
        nodes: vec![BuildNode {
            id: "n1".to_string(),
            display_name: "compile".to_string(),
            phase: BuildPhase::Succeeded,
        }],
    }
}

async fn wait_terminal(store: &MemoryDeploymentStore, id: &str) -> Deployment {
    for _ in 0..400 {
        let deployment = store.get(id).await.unwrap();
        if deployment.status.is_terminal() {
            return deployment;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("deployment {} never reached a terminal status", id);
}

async fn connect(
    addr: std::net::SocketAddr,
    id: &str,
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let url = format!("ws://{}/deployments/{}/stream", addr, id);
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

#[tokio::test]
async fn test_late_joiner_streams_gap_free_transcript() {
    // The render step stalls long enough for the observer to attach mid-run,
    // so the stream covers both the replayed and the live portion.
    let render = "printf 'PLAY [site]\\n'\nprintf 'TASK [Render manifests] ***\\n'\nprintf 'ok: [localhost]\\n'\nsleep 1\n";
    let ci = Arc::new(MemoryCi::with_build(
        "build-shop-1",
        vec![running_build(), succeeded_build()],
    ));
    let h = harness(render, ci).await;

    let deployment = shop_deployment();
    let id = deployment.id.clone();
    h.store.insert(deployment).await.unwrap();
    h.orchestrator.start(&id).await.unwrap();

    // Join while the render subprocess is still running.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut ws = connect(h.addr, &id).await;

    let mut received: Vec<serde_json::Value> = Vec::new();
    while let Some(message) = ws.next().await {
        match message.unwrap() {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                let done = value["type"] == "complete";
                received.push(value);
                if done {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    let done = wait_terminal(&h.store, &id).await;
    assert_eq!(done.status, DeploymentStatus::Success);

    // The stream delivered the persisted transcript exactly: same frames,
    // same order, no duplicates across the replay/live boundary.
    let entries = h.logs.list(&id).await.unwrap();
    assert_eq!(received.len(), entries.len());
    for (got, entry) in received.iter().zip(entries.iter()) {
        assert_eq!(got, &serde_json::to_value(&entry.message).unwrap());
    }

    assert_eq!(received.first().unwrap()["type"], "start");
    let last = received.last().unwrap();
    assert_eq!(last["type"], "complete");
    assert_eq!(last["status"], "success");
    assert_eq!(last["return_code"], 0);
}

#[tokio::test]
async fn test_socket_loss_during_build_monitoring_fails_deployment() {
    // A build that never finishes keeps the deployment in the monitoring
    // loop until the observer goes away.
    let render = "printf 'ok: [localhost]\\n'\n";
    let ci = Arc::new(MemoryCi::with_build("build-shop-1", vec![running_build()]));
    let h = harness(render, ci).await;

    let deployment = shop_deployment();
    let id = deployment.id.clone();
    h.store.insert(deployment).await.unwrap();
    h.orchestrator.start(&id).await.unwrap();

    let mut ws = connect(h.addr, &id).await;

    // Read until the build trigger is announced, so the drop below lands
    // inside the monitoring loop.
    while let Some(message) = ws.next().await {
        if let Message::Text(text) = message.unwrap() {
            if text.as_str().contains("triggered") {
                break;
            }
        }
    }
    ws.close(None).await.unwrap();
    drop(ws);

    let done = wait_terminal(&h.store, &id).await;
    assert_eq!(done.status, DeploymentStatus::Failed);
    assert!(done.output.unwrap().contains("disconnected"));
    assert!(!h.orchestrator.is_running(&id).await);
}
