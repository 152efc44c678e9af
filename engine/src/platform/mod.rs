//! Capability interfaces for the platform collaborators
//!
//! Kubernetes, the git host and the CI system are consumed through these
//! traits. Every creation call is an idempotent upsert ("already exists"
//! is success); polling calls are pure reads. In-memory implementations
//! back tests and local mode; `githost` and `ci` provide the REST-backed
//! implementations for the two collaborators that are plain HTTP surfaces.

pub mod ci;
pub mod githost;
pub mod memory;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Credential material fetched from a platform secret
#[derive(Debug, Clone, Default)]
pub struct SecretMaterial {
    entries: BTreeMap<String, SecretString>,
}

impl SecretMaterial {
    pub fn new(entries: BTreeMap<String, SecretString>) -> Self {
        Self { entries }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), SecretString::from(v.into())))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&SecretString> {
        self.entries.get(key)
    }

    /// Expose the material as plain key/value pairs for secret creation
    pub fn expose(&self) -> BTreeMap<String, String> {
        use secrecy::ExposeSecret;
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.expose_secret().to_string()))
            .collect()
    }
}

/// A registered webhook on a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: u64,
    pub url: String,
}

/// GitOps application resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitopsApp {
    pub name: String,
    pub namespace: String,
    pub repo_url: String,
    pub revision: String,
}

/// Service-discovery record for a deployed application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub namespace: String,
    pub url: String,
}

/// Application metadata record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub name: String,
    pub template: String,
    pub owner: String,
}

/// Phase of a CI build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
}

impl BuildPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildPhase::Succeeded | BuildPhase::Failed | BuildPhase::Error
        )
    }
}

/// One node/step inside a CI build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildNode {
    pub id: String,
    pub display_name: String,
    pub phase: BuildPhase,
}

/// Status snapshot of a CI build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStatus {
    pub name: String,
    pub phase: BuildPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub nodes: Vec<BuildNode>,
}

/// Cluster-side operations (namespaces, secrets, configs, GitOps and
/// discovery records, databases)
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create the namespace if absent
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), EngineError>;

    /// Read credential material from a platform secret
    async fn read_secret(&self, namespace: &str, name: &str)
        -> Result<SecretMaterial, EngineError>;

    /// Create or replace a secret
    async fn upsert_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), EngineError>;

    /// Create or replace a config object
    async fn upsert_config(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), EngineError>;

    /// Create or update the GitOps application resource
    async fn upsert_gitops_app(&self, app: GitopsApp) -> Result<(), EngineError>;

    /// Publish a service-discovery record
    async fn upsert_service_record(&self, record: ServiceRecord) -> Result<(), EngineError>;

    /// Register application metadata
    async fn upsert_app_record(&self, record: AppRecord) -> Result<(), EngineError>;

    /// Create a database if absent
    async fn ensure_database(&self, name: &str) -> Result<(), EngineError>;
}

/// Git hosting operations
#[async_trait]
pub trait GitHostApi: Send + Sync {
    /// Create the repository if absent
    async fn ensure_repository(&self, owner: &str, name: &str) -> Result<(), EngineError>;

    /// List registered webhooks
    async fn list_webhooks(&self, owner: &str, repo: &str) -> Result<Vec<Webhook>, EngineError>;

    /// Register a push webhook
    async fn create_webhook(
        &self,
        owner: &str,
        repo: &str,
        callback_url: &str,
    ) -> Result<Webhook, EngineError>;

    /// Remove a webhook by id
    async fn delete_webhook(&self, owner: &str, repo: &str, id: u64) -> Result<(), EngineError>;

    /// Commit the working tree and force-push it to the repository
    async fn push(
        &self,
        owner: &str,
        repo: &str,
        worktree: &Path,
        message: &str,
    ) -> Result<(), EngineError>;
}

/// CI workflow operations
#[async_trait]
pub trait CiApi: Send + Sync {
    /// Find the build triggered for an application, by label
    async fn find_build(&self, app: &str) -> Result<Option<String>, EngineError>;

    /// Fetch the status of a build by name
    async fn build_status(&self, name: &str) -> Result<BuildStatus, EngineError>;
}

/// Bundle of platform capabilities handed to the provisioner
#[derive(Clone)]
pub struct PlatformServices {
    pub cluster: Arc<dyn ClusterApi>,
    pub githost: Arc<dyn GitHostApi>,
    pub ci: Arc<dyn CiApi>,
}
