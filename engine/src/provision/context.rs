//! Execution context assembly for automation tool invocations

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::errors::EngineError;
use crate::storage::settings::AutomationSettings;

/// Credential files the automation tool expects in the secrets mount.
///
/// These come from the deployment environment; their absence is a
/// configuration defect, not a transient fault, so context building fails
/// fast and is never retried.
const REQUIRED_CREDENTIAL_FILES: &[&str] = &["kubeconfig", "registry-token"];

/// Kind of automation invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// Template rendering run
    Template,

    /// Optional platform component run (e.g. database migrations)
    OptionalComponent,
}

/// A self-contained execution context for one automation invocation
#[derive(Debug)]
pub struct ExecutionContext {
    /// Program to execute
    pub program: String,

    /// Full argument list
    pub args: Vec<String>,

    /// Merged environment
    pub env: Vec<(String, String)>,

    /// Working directory
    pub workdir: PathBuf,

    /// Extra-vars file passed to the tool; deleted when the context is
    /// dropped, so callers own the cleanup
    pub vars_file: NamedTempFile,
}

/// Builds execution contexts from the automation settings
pub struct ContextBuilder<'a> {
    settings: &'a AutomationSettings,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(settings: &'a AutomationSettings) -> Self {
        Self { settings }
    }

    /// Assemble the context for one invocation.
    ///
    /// The two invocation kinds differ only in the role search path and the
    /// variable set the caller hands in.
    pub fn build(
        &self,
        kind: InvocationKind,
        playbook: &str,
        worktree: &Path,
        variables: &HashMap<String, serde_json::Value>,
    ) -> Result<ExecutionContext, EngineError> {
        let secrets_dir = &self.settings.secrets_dir;
        if !secrets_dir.is_dir() {
            return Err(EngineError::ConfigError(format!(
                "secrets mount {} is absent",
                secrets_dir.display()
            )));
        }
        for file in REQUIRED_CREDENTIAL_FILES {
            if !secrets_dir.join(file).is_file() {
                return Err(EngineError::ConfigError(format!(
                    "credential file {} missing from secrets mount",
                    file
                )));
            }
        }

        let playbook_path = self.settings.playbook_dir.join(playbook);

        let roles_dir = match kind {
            InvocationKind::Template => &self.settings.roles_dir,
            InvocationKind::OptionalComponent => &self.settings.component_roles_dir,
        };

        let mut vars_file = NamedTempFile::new()?;
        serde_json::to_writer(&mut vars_file, variables)?;
        vars_file.flush()?;

        let args = vec![
            playbook_path.display().to_string(),
            "-i".to_string(),
            self.settings.inventory.display().to_string(),
            "-e".to_string(),
            format!("@{}", vars_file.path().display()),
        ];

        let env = vec![
            (
                "KUBECONFIG".to_string(),
                secrets_dir.join("kubeconfig").display().to_string(),
            ),
            (
                "REGISTRY_TOKEN_FILE".to_string(),
                secrets_dir.join("registry-token").display().to_string(),
            ),
            (
                "ANSIBLE_ROLES_PATH".to_string(),
                roles_dir.display().to_string(),
            ),
            ("ANSIBLE_FORCE_COLOR".to_string(), "0".to_string()),
        ];

        Ok(ExecutionContext {
            program: self.settings.command.clone(),
            args,
            env,
            workdir: worktree.to_path_buf(),
            vars_file,
        })
    }
}
