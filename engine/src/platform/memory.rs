//! In-memory platform implementations for tests and local mode

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::errors::EngineError;
use crate::platform::{
    AppRecord, BuildStatus, CiApi, ClusterApi, GitHostApi, GitopsApp, SecretMaterial,
    ServiceRecord, Webhook,
};

/// In-memory cluster
#[derive(Default)]
pub struct MemoryCluster {
    namespaces: RwLock<HashSet<String>>,
    seeded_secrets: RwLock<HashMap<(String, String), SecretMaterial>>,
    secrets: RwLock<HashMap<(String, String), BTreeMap<String, String>>>,
    configs: RwLock<HashMap<(String, String), BTreeMap<String, String>>>,
    gitops_apps: RwLock<HashMap<String, GitopsApp>>,
    service_records: RwLock<HashMap<String, ServiceRecord>>,
    app_records: RwLock<HashMap<String, AppRecord>>,
    databases: RwLock<HashSet<String>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed credential material readable through `read_secret`
    pub async fn seed_secret(&self, namespace: &str, name: &str, material: SecretMaterial) {
        self.seeded_secrets
            .write()
            .await
            .insert((namespace.to_string(), name.to_string()), material);
    }

    pub async fn has_secret(&self, namespace: &str, name: &str) -> bool {
        self.secrets
            .read()
            .await
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    pub async fn secret_count(&self) -> usize {
        self.secrets.read().await.len()
    }

    pub async fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.read().await.contains(namespace)
    }

    pub async fn gitops_app(&self, name: &str) -> Option<GitopsApp> {
        self.gitops_apps.read().await.get(name).cloned()
    }

    pub async fn service_record(&self, name: &str) -> Option<ServiceRecord> {
        self.service_records.read().await.get(name).cloned()
    }

    pub async fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().await.iter().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), EngineError> {
        self.namespaces.write().await.insert(namespace.to_string());
        Ok(())
    }

    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<SecretMaterial, EngineError> {
        self.seeded_secrets
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| EngineError::ConfigError(format!("secret {}/{} missing", namespace, name)))
    }

    async fn upsert_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        debug!("upsert secret {}/{}", namespace, name);
        self.secrets
            .write()
            .await
            .insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }

    async fn upsert_config(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        self.configs
            .write()
            .await
            .insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }

    async fn upsert_gitops_app(&self, app: GitopsApp) -> Result<(), EngineError> {
        self.gitops_apps.write().await.insert(app.name.clone(), app);
        Ok(())
    }

    async fn upsert_service_record(&self, record: ServiceRecord) -> Result<(), EngineError> {
        self.service_records
            .write()
            .await
            .insert(record.name.clone(), record);
        Ok(())
    }

    async fn upsert_app_record(&self, record: AppRecord) -> Result<(), EngineError> {
        self.app_records
            .write()
            .await
            .insert(record.name.clone(), record);
        Ok(())
    }

    async fn ensure_database(&self, name: &str) -> Result<(), EngineError> {
        self.databases.write().await.insert(name.to_string());
        Ok(())
    }
}

/// In-memory git host
#[derive(Default)]
pub struct MemoryGitHost {
    repositories: RwLock<HashSet<(String, String)>>,
    webhooks: RwLock<HashMap<(String, String), Vec<Webhook>>>,
    pushes: RwLock<Vec<(String, String, String)>>,
    next_hook_id: AtomicU64,
}

impl MemoryGitHost {
    pub fn new() -> Self {
        Self {
            next_hook_id: AtomicU64::new(1),
            ..Self::default()
        }
    }

    pub async fn has_repository(&self, owner: &str, name: &str) -> bool {
        self.repositories
            .read()
            .await
            .contains(&(owner.to_string(), name.to_string()))
    }

    pub async fn webhooks(&self, owner: &str, repo: &str) -> Vec<Webhook> {
        self.webhooks
            .read()
            .await
            .get(&(owner.to_string(), repo.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn push_count(&self) -> usize {
        self.pushes.read().await.len()
    }
}

#[async_trait]
impl GitHostApi for MemoryGitHost {
    async fn ensure_repository(&self, owner: &str, name: &str) -> Result<(), EngineError> {
        self.repositories
            .write()
            .await
            .insert((owner.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_webhooks(&self, owner: &str, repo: &str) -> Result<Vec<Webhook>, EngineError> {
        Ok(self.webhooks(owner, repo).await)
    }

    async fn create_webhook(
        &self,
        owner: &str,
        repo: &str,
        callback_url: &str,
    ) -> Result<Webhook, EngineError> {
        let hook = Webhook {
            id: self.next_hook_id.fetch_add(1, Ordering::SeqCst),
            url: callback_url.to_string(),
        };
        self.webhooks
            .write()
            .await
            .entry((owner.to_string(), repo.to_string()))
            .or_default()
            .push(hook.clone());
        Ok(hook)
    }

    async fn delete_webhook(&self, owner: &str, repo: &str, id: u64) -> Result<(), EngineError> {
        if let Some(hooks) = self
            .webhooks
            .write()
            .await
            .get_mut(&(owner.to_string(), repo.to_string()))
        {
            hooks.retain(|h| h.id != id);
        }
        Ok(())
    }

    async fn push(
        &self,
        owner: &str,
        repo: &str,
        _worktree: &Path,
        message: &str,
    ) -> Result<(), EngineError> {
        self.pushes
            .write()
            .await
            .push((owner.to_string(), repo.to_string(), message.to_string()));
        Ok(())
    }
}

/// In-memory CI system.
///
/// Tests script the build lifecycle: `with_build` registers a build name and
/// a queue of status snapshots that successive polls walk through (the last
/// snapshot repeats). `idle()` builds a CI that never triggers anything.
pub struct MemoryCi {
    build_name: Option<String>,
    /// Polls of `find_build` to answer `None` before the build appears
    trigger_after_polls: AtomicU64,
    snapshots: Mutex<VecDeque<BuildStatus>>,
    last: Mutex<Option<BuildStatus>>,
}

impl MemoryCi {
    /// A CI system where no build is ever triggered
    pub fn idle() -> Self {
        Self {
            build_name: None,
            trigger_after_polls: AtomicU64::new(0),
            snapshots: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
        }
    }

    /// A CI system that reports `name` triggered and walks the snapshots
    pub fn with_build(name: impl Into<String>, snapshots: Vec<BuildStatus>) -> Self {
        Self {
            build_name: Some(name.into()),
            trigger_after_polls: AtomicU64::new(0),
            snapshots: Mutex::new(snapshots.into()),
            last: Mutex::new(None),
        }
    }

    /// Delay the trigger: the first `polls` calls to `find_build` answer None
    pub fn triggered_after(mut self, polls: u64) -> Self {
        self.trigger_after_polls = AtomicU64::new(polls);
        self
    }
}

#[async_trait]
impl CiApi for MemoryCi {
    async fn find_build(&self, _app: &str) -> Result<Option<String>, EngineError> {
        let Some(name) = &self.build_name else {
            return Ok(None);
        };
        let remaining = self.trigger_after_polls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.trigger_after_polls.fetch_sub(1, Ordering::SeqCst);
            return Ok(None);
        }
        Ok(Some(name.clone()))
    }

    async fn build_status(&self, name: &str) -> Result<BuildStatus, EngineError> {
        let mut snapshots = self.snapshots.lock().await;
        if let Some(snapshot) = snapshots.pop_front() {
            *self.last.lock().await = Some(snapshot.clone());
            return Ok(snapshot);
        }
        self.last
            .lock()
            .await
            .clone()
            .ok_or_else(|| EngineError::NotFound(format!("build {}", name)))
    }
}
