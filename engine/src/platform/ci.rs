//! Argo-Workflows-backed CI client

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{header, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::errors::EngineError;
use crate::platform::{BuildNode, BuildPhase, BuildStatus, CiApi};

/// Label the CI pipeline stamps on builds it triggers for an application
const APP_LABEL: &str = "berth.dev/app";

/// CI client against an Argo-Workflows-compatible REST API
pub struct ArgoCi {
    client: Client,
    api_base: String,
    namespace: String,
    token: SecretString,
}

impl ArgoCi {
    pub fn new(api_base: &str, namespace: &str, token: SecretString) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            token,
        })
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, EngineError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .header(header::AUTHORIZATION, self.auth())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::ExternalError(format!("{}: {}", status, body)));
        }

        Ok(response.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowList {
    #[serde(default)]
    items: Vec<Workflow>,
}

#[derive(Debug, Deserialize)]
struct Workflow {
    metadata: WorkflowMeta,
    #[serde(default)]
    status: WorkflowStatus,
}

#[derive(Debug, Deserialize)]
struct WorkflowMeta {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    nodes: HashMap<String, WorkflowNode>,
}

#[derive(Debug, Deserialize)]
struct WorkflowNode {
    id: String,
    #[serde(rename = "displayName", default)]
    display_name: String,
    #[serde(default)]
    phase: Option<String>,
}

fn parse_phase(phase: Option<&str>) -> BuildPhase {
    match phase {
        Some("Running") => BuildPhase::Running,
        Some("Succeeded") => BuildPhase::Succeeded,
        Some("Failed") => BuildPhase::Failed,
        Some("Error") => BuildPhase::Error,
        _ => BuildPhase::Pending,
    }
}

#[async_trait]
impl CiApi for ArgoCi {
    async fn find_build(&self, app: &str) -> Result<Option<String>, EngineError> {
        let url = format!(
            "{}/workflows/{}?listOptions.labelSelector={}={}",
            self.api_base, self.namespace, APP_LABEL, app
        );
        let list: WorkflowList = self.get_json(&url).await?;
        Ok(list.items.into_iter().next().map(|w| w.metadata.name))
    }

    async fn build_status(&self, name: &str) -> Result<BuildStatus, EngineError> {
        let url = format!("{}/workflows/{}/{}", self.api_base, self.namespace, name);
        let workflow: Workflow = self.get_json(&url).await?;

        let mut nodes: Vec<BuildNode> = workflow
            .status
            .nodes
            .into_values()
            .map(|n| BuildNode {
                phase: parse_phase(n.phase.as_deref()),
                display_name: if n.display_name.is_empty() {
                    n.id.clone()
                } else {
                    n.display_name
                },
                id: n.id,
            })
            .collect();
        // The API returns nodes as an unordered map; present them stably.
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(BuildStatus {
            name: workflow.metadata.name,
            phase: parse_phase(workflow.status.phase.as_deref()),
            message: workflow.status.message,
            nodes,
        })
    }
}
