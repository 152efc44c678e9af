//! Template reference and rendered platform configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Reference to an application template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRef {
    /// Template name, e.g. "fastapi-postgres"
    pub name: String,

    /// Template version tag
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "latest".to_string()
}

impl TemplateRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
        }
    }
}

/// Declarative platform config shipped inside a rendered template tree.
///
/// Rendered templates place a `platform.json` at the root of the working
/// tree describing the resources the application expects beyond the
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Databases to create if absent
    #[serde(default)]
    pub databases: Vec<String>,

    /// Optional CI workflow template (raw manifest) to install in the
    /// shared automation namespace
    #[serde(default)]
    pub workflow_template: Option<String>,

    /// Webhook path on the git host callback, relative to the engine's
    /// callback base URL
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,

    /// Whether to register pipeline monitoring metadata after deployment
    #[serde(default)]
    pub pipeline_monitoring: bool,
}

fn default_webhook_path() -> String {
    "/hooks/build".to_string()
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            databases: Vec::new(),
            workflow_template: None,
            webhook_path: default_webhook_path(),
            pipeline_monitoring: false,
        }
    }
}

/// File name of the declarative config inside a rendered tree
pub const PLATFORM_CONFIG_FILE: &str = "platform.json";

impl PlatformConfig {
    /// Load the declarative config from a rendered working tree.
    ///
    /// A missing file is not an error; templates without platform needs
    /// simply get the defaults.
    pub async fn load(worktree: &Path) -> Result<Self, EngineError> {
        let path = worktree.join(PLATFORM_CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }
}
