//! Gitea-backed git hosting implementation

use std::path::Path;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::{header, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, error, info};
use url::Url;

use crate::errors::EngineError;
use crate::platform::{GitHostApi, Webhook};

/// Git hosting client against a Gitea-compatible REST API
pub struct GiteaGitHost {
    client: Client,
    api_base: String,
    token: SecretString,
}

impl GiteaGitHost {
    pub fn new(api_base: &str, token: SecretString) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn auth(&self) -> String {
        format!("token {}", self.token.expose_secret())
    }

    /// Remote URL with embedded token credentials for pushing
    fn remote_url(&self, owner: &str, repo: &str) -> Result<String, EngineError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| EngineError::ConfigError(format!("invalid git API base: {}", e)))?;
        url.set_path(&format!("/{}/{}.git", owner, repo));
        url.set_username("oauth2")
            .map_err(|_| EngineError::ConfigError("git remote URL rejects credentials".into()))?;
        url.set_password(Some(self.token.expose_secret()))
            .map_err(|_| EngineError::ConfigError("git remote URL rejects credentials".into()))?;
        Ok(url.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct GiteaHook {
    id: u64,
    config: GiteaHookConfig,
}

#[derive(Debug, Deserialize)]
struct GiteaHookConfig {
    #[serde(default)]
    url: String,
}

#[async_trait]
impl GitHostApi for GiteaGitHost {
    async fn ensure_repository(&self, owner: &str, name: &str) -> Result<(), EngineError> {
        let url = self.url(&format!("/orgs/{}/repos", owner));
        debug!("POST {}", url);

        let body = serde_json::json!({
            "name": name,
            "private": true,
            "auto_init": false,
        });

        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, self.auth())
            .json(&body)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                info!("Created repository {}/{}", owner, name);
                Ok(())
            }
            // Already exists is success, not an error.
            StatusCode::CONFLICT => {
                debug!("Repository {}/{} already exists", owner, name);
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                error!("Repository create failed: {} - {}", status, body);
                Err(EngineError::ExternalError(format!("{}: {}", status, body)))
            }
        }
    }

    async fn list_webhooks(&self, owner: &str, repo: &str) -> Result<Vec<Webhook>, EngineError> {
        let url = self.url(&format!("/repos/{}/{}/hooks", owner, repo));
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, self.auth())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::ExternalError(format!("{}: {}", status, body)));
        }

        let hooks: Vec<GiteaHook> = response.json().await?;
        Ok(hooks
            .into_iter()
            .map(|h| Webhook {
                id: h.id,
                url: h.config.url,
            })
            .collect())
    }

    async fn create_webhook(
        &self,
        owner: &str,
        repo: &str,
        callback_url: &str,
    ) -> Result<Webhook, EngineError> {
        let url = self.url(&format!("/repos/{}/{}/hooks", owner, repo));
        debug!("POST {}", url);

        let body = serde_json::json!({
            "type": "gitea",
            "active": true,
            "events": ["push"],
            "config": {
                "url": callback_url,
                "content_type": "json",
            },
        });

        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, self.auth())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::ExternalError(format!("{}: {}", status, body)));
        }

        let hook: GiteaHook = response.json().await?;
        Ok(Webhook {
            id: hook.id,
            url: hook.config.url,
        })
    }

    async fn delete_webhook(&self, owner: &str, repo: &str, id: u64) -> Result<(), EngineError> {
        let url = self.url(&format!("/repos/{}/{}/hooks/{}", owner, repo, id));
        debug!("DELETE {}", url);

        let response = self
            .client
            .delete(&url)
            .header(header::AUTHORIZATION, self.auth())
            .send()
            .await?;

        // A hook deleted by a concurrent run is fine.
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::ExternalError(format!("{}: {}", status, body)));
        }
        Ok(())
    }

    async fn push(
        &self,
        owner: &str,
        repo: &str,
        worktree: &Path,
        message: &str,
    ) -> Result<(), EngineError> {
        info!("Pushing rendered tree to {}/{}", owner, repo);
        let remote = self.remote_url(owner, repo)?;

        run_git(worktree, &["init", "-b", "main"]).await?;
        run_git(worktree, &["add", "-A"]).await?;
        run_git(
            worktree,
            &[
                "-c",
                "user.name=berthd",
                "-c",
                "user.email=berthd@berth.dev",
                "commit",
                "--allow-empty",
                "-m",
                message,
            ],
        )
        .await?;
        run_git(worktree, &["push", "--force", &remote, "main"]).await?;

        info!("Pushed deployment repository {}/{}", owner, repo);
        Ok(())
    }
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<(), EngineError> {
    debug!("git {}", args.join(" "));
    let status = Command::new("git")
        .current_dir(dir)
        .args(args)
        .status()
        .await
        .map_err(|e| EngineError::ProcessError(format!("failed to run git: {}", e)))?;

    if !status.success() {
        return Err(EngineError::ExternalError(format!(
            "git {} failed with status {}",
            args.first().copied().unwrap_or_default(),
            status.code().unwrap_or(-1)
        )));
    }
    Ok(())
}
