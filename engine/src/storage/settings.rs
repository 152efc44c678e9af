//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::logs::LogLevel;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// HTTP/WebSocket server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// External automation tool configuration
    #[serde(default)]
    pub automation: AutomationSettings,

    /// Git hosting configuration
    #[serde(default)]
    pub git: GitSettings,

    /// CI build monitoring configuration
    #[serde(default)]
    pub ci: CiSettings,

    /// Namespace holding shared platform credentials
    #[serde(default = "default_platform_namespace")]
    pub platform_namespace: String,

    /// Maximum streaming message payload size in bytes; larger payloads
    /// are chunked
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_platform_namespace() -> String {
    "platform".to_string()
}

fn default_max_message_bytes() -> usize {
    16 * 1024
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            server: ServerSettings::default(),
            automation: AutomationSettings::default(),
            git: GitSettings::default(),
            ci: CiSettings::default(),
            platform_namespace: default_platform_namespace(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub async fn load(path: &std::path::Path) -> Result<Self, EngineError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let settings = serde_json::from_str(&raw)?;
        Ok(settings)
    }
}

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// External automation tool settings.
///
/// The engine shells out to the platform automation tool to render
/// templates and run optional component roles; these paths describe the
/// deployment environment the tool expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationSettings {
    /// Automation tool command
    #[serde(default = "default_command")]
    pub command: String,

    /// Directory holding the template playbooks
    #[serde(default = "default_playbook_dir")]
    pub playbook_dir: PathBuf,

    /// Role search path for template invocations
    #[serde(default = "default_roles_dir")]
    pub roles_dir: PathBuf,

    /// Role search path for optional-component invocations
    #[serde(default = "default_component_roles_dir")]
    pub component_roles_dir: PathBuf,

    /// Inventory file passed to the tool
    #[serde(default = "default_inventory")]
    pub inventory: PathBuf,

    /// Mounted directory holding platform credential files
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,

    /// Grace period between terminate and unconditional kill
    #[serde(default = "default_kill_grace_secs", rename = "kill_grace_secs")]
    pub kill_grace: u64,
}

fn default_command() -> String {
    "ansible-playbook".to_string()
}

fn default_playbook_dir() -> PathBuf {
    PathBuf::from("/etc/berth/playbooks")
}

fn default_roles_dir() -> PathBuf {
    PathBuf::from("/etc/berth/roles")
}

fn default_component_roles_dir() -> PathBuf {
    PathBuf::from("/etc/berth/components")
}

fn default_inventory() -> PathBuf {
    PathBuf::from("/etc/berth/inventory.ini")
}

fn default_secrets_dir() -> PathBuf {
    PathBuf::from("/run/berth/secrets")
}

fn default_kill_grace_secs() -> u64 {
    5
}

impl AutomationSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace)
    }
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            command: default_command(),
            playbook_dir: default_playbook_dir(),
            roles_dir: default_roles_dir(),
            component_roles_dir: default_component_roles_dir(),
            inventory: default_inventory(),
            secrets_dir: default_secrets_dir(),
            kill_grace: default_kill_grace_secs(),
        }
    }
}

/// Git hosting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSettings {
    /// Base URL of the git hosting API
    #[serde(default = "default_git_api")]
    pub api_base: String,

    /// Organization owning the deployment repositories
    #[serde(default = "default_git_org")]
    pub organization: String,

    /// Base URL the git host calls back into on push
    #[serde(default = "default_callback_base")]
    pub callback_base: String,
}

fn default_git_api() -> String {
    "http://gitea.platform.svc:3000/api/v1".to_string()
}

fn default_git_org() -> String {
    "deployments".to_string()
}

fn default_callback_base() -> String {
    "http://berthd.platform.svc:8420".to_string()
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            api_base: default_git_api(),
            organization: default_git_org(),
            callback_base: default_callback_base(),
        }
    }
}

/// CI build monitoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiSettings {
    /// Base URL of the CI workflow API
    #[serde(default = "default_ci_api")]
    pub api_base: String,

    /// Shared automation namespace holding CI tokens and templates
    #[serde(default = "default_ci_namespace")]
    pub namespace: String,

    /// How long to wait for a build to be triggered before failing
    #[serde(default = "default_trigger_timeout_secs", rename = "trigger_timeout_secs")]
    pub trigger_timeout: u64,

    /// Interval between status polls
    #[serde(default = "default_poll_interval_secs", rename = "poll_interval_secs")]
    pub poll_interval: u64,
}

fn default_ci_api() -> String {
    "http://argo-workflows.ci.svc:2746/api/v1".to_string()
}

fn default_ci_namespace() -> String {
    "ci".to_string()
}

fn default_trigger_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl CiSettings {
    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_secs(self.trigger_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

impl Default for CiSettings {
    fn default() -> Self {
        Self {
            api_base: default_ci_api(),
            namespace: default_ci_namespace(),
            trigger_timeout: default_trigger_timeout_secs(),
            poll_interval: default_poll_interval_secs(),
        }
    }
}
