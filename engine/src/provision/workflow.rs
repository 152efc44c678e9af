//! Phased provisioning workflow
//!
//! Five sequential phases turn a deployment record into running
//! infrastructure. Phases 2 and 3 fan out concurrently; phase 4 is strictly
//! sequential because each step depends on the previous one. Completed
//! phases are never rolled back: a later failure leaves partial
//! infrastructure in place and re-running the deployment is the recovery
//! path, which is why every creation call is an idempotent upsert.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use futures::future;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::EngineError;
use crate::exec::events::EventSink;
use crate::models::deployment::Deployment;
use crate::models::message::{EventType, StreamMessage};
use crate::models::template::PlatformConfig;
use crate::platform::{
    AppRecord, BuildPhase, GitopsApp, PlatformServices, SecretMaterial, ServiceRecord,
};
use crate::provision::context::{ContextBuilder, InvocationKind};
use crate::provision::runner::{classify, task_name, ProcessHandle, ProcessRunner, RunnerEvent};
use crate::storage::settings::Settings;

/// Variables every deployment must carry
const REQUIRED_VARIABLES: &[&str] = &["namespace"];

/// Playbook rendering the template into the working tree
const RENDER_PLAYBOOK: &str = "render.yml";

/// Playbook generating pending database migrations
const MIGRATIONS_PLAYBOOK: &str = "migrations.yml";

/// Credential material gathered during phase 2
#[derive(Debug)]
struct GatheredMaterial {
    tls: SecretMaterial,
    registry: SecretMaterial,
    admin: SecretMaterial,
    ci_token: SecretMaterial,
    object_store: SecretMaterial,
    gitops: SecretMaterial,
}

pub struct Provisioner {
    deployment: Deployment,
    settings: Arc<Settings>,
    platform: PlatformServices,
    sink: Arc<EventSink>,
    process: Arc<ProcessHandle>,
    cancel: CancellationToken,
}

impl Provisioner {
    pub fn new(
        deployment: Deployment,
        settings: Arc<Settings>,
        platform: PlatformServices,
        sink: Arc<EventSink>,
        process: Arc<ProcessHandle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            deployment,
            settings,
            platform,
            sink,
            process,
            cancel,
        }
    }

    /// Run all five phases to completion.
    ///
    /// Returns the final return code (zero) on success. Any phase error
    /// aborts the remaining phases immediately; already completed work
    /// stays in place.
    pub async fn run(&self) -> Result<i32, EngineError> {
        let worktree = tempfile::tempdir()?;

        self.setup_and_validate(worktree.path()).await?;
        self.checkpoint()?;

        let (material, config) = self.gather_resources(worktree.path()).await?;
        self.checkpoint()?;

        self.create_resources(&material, &config).await?;
        self.checkpoint()?;

        self.git_handoff_and_monitor(worktree.path(), &config).await?;
        self.checkpoint()?;

        self.register_deployment(&material, &config).await?;

        Ok(0)
    }

    /// Cancellation barrier between phases
    fn checkpoint(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    async fn phase(&self, number: u32, title: &str) {
        info!(
            deployment_id = %self.deployment.id,
            "Phase {}/5: {}", number, title
        );
        self.sink
            .emit(StreamMessage::new(
                EventType::Phase,
                format!("Phase {}/5: {}", number, title),
            ))
            .await;
    }

    fn namespace(&self) -> Result<&str, EngineError> {
        self.deployment
            .variable("namespace")
            .ok_or_else(|| EngineError::ValidationError("required variable namespace is missing".into()))
    }

    /// Phase 1: verify required variables, ensure the target namespace,
    /// render the template into the working tree.
    async fn setup_and_validate(&self, worktree: &Path) -> Result<(), EngineError> {
        self.phase(1, "Setup and validation").await;

        for key in REQUIRED_VARIABLES {
            if self.deployment.variable(key).is_none() {
                return Err(EngineError::ValidationError(format!(
                    "required variable {} is missing",
                    key
                )));
            }
        }

        let namespace = self.namespace()?;
        self.platform.cluster.ensure_namespace(namespace).await?;
        self.sink
            .emit(StreamMessage::new(
                EventType::Ok,
                format!("Namespace {} ready", namespace),
            ))
            .await;

        self.run_automation(InvocationKind::Template, RENDER_PLAYBOOK, worktree)
            .await?;
        self.sink
            .emit(StreamMessage::new(
                EventType::Ok,
                format!("Rendered template {}", self.deployment.template.name),
            ))
            .await;
        Ok(())
    }

    /// Phase 2: fetch all credential material concurrently, parse the
    /// declarative config from the rendered tree, then ensure the
    /// deployment repository exists.
    async fn gather_resources(
        &self,
        worktree: &Path,
    ) -> Result<(GatheredMaterial, PlatformConfig), EngineError> {
        self.phase(2, "Resource gathering").await;

        let platform_ns = self.settings.platform_namespace.as_str();
        let ci_ns = self.settings.ci.namespace.as_str();
        let cluster = &self.platform.cluster;

        let (tls, registry, admin, ci_token, object_store, gitops, git, config) = tokio::try_join!(
            cluster.read_secret(platform_ns, "platform-tls"),
            cluster.read_secret(platform_ns, "registry-credentials"),
            cluster.read_secret(platform_ns, "admin-credentials"),
            cluster.read_secret(ci_ns, "ci-token"),
            cluster.read_secret(platform_ns, "object-store-credentials"),
            cluster.read_secret(platform_ns, "gitops-credentials"),
            cluster.read_secret(platform_ns, "git-credentials"),
            PlatformConfig::load(worktree),
        )?;

        // The git token gates the repository step below; a blank secret is a
        // deployment-environment defect, same as a missing one. The push
        // itself authenticates with the engine's mounted token.
        let token_usable = git
            .get("token")
            .is_some_and(|t| !t.expose_secret().is_empty());
        if !token_usable {
            return Err(EngineError::ConfigError(
                "git-credentials secret has no usable token entry".into(),
            ));
        }

        self.sink
            .emit(StreamMessage::new(EventType::Ok, "Gathered platform credentials"))
            .await;

        let org = self.settings.git.organization.as_str();
        self.platform
            .githost
            .ensure_repository(org, &self.deployment.name)
            .await?;
        self.sink
            .emit(StreamMessage::new(
                EventType::Ok,
                format!("Repository {}/{} ready", org, self.deployment.name),
            ))
            .await;

        Ok((
            GatheredMaterial {
                tls,
                registry,
                admin,
                ci_token,
                object_store,
                gitops,
            },
            config,
        ))
    }

    /// Phase 3: create all application resources concurrently. Each
    /// creation is individually idempotent.
    async fn create_resources(
        &self,
        material: &GatheredMaterial,
        config: &PlatformConfig,
    ) -> Result<(), EngineError> {
        self.phase(3, "Resource creation").await;

        let namespace = self.namespace()?.to_string();
        let ci_ns = self.settings.ci.namespace.clone();
        let app = self.deployment.name.clone();
        let cluster = &self.platform.cluster;

        let db_credentials = {
            let mut data = BTreeMap::new();
            data.insert("username".to_string(), app.clone());
            data.insert(
                "password".to_string(),
                uuid::Uuid::new_v4().simple().to_string(),
            );
            data
        };

        let tracking_config = {
            let mut data: BTreeMap<String, String> = material
                .object_store
                .expose()
                .into_iter()
                .map(|(k, v)| (format!("s3_{}", k), v))
                .collect();
            data.insert(
                "tracking_uri".to_string(),
                format!("http://tracking.{}.svc", self.settings.platform_namespace),
            );
            if let Some(user) = material.admin.get("username") {
                data.insert("admin_username".to_string(), user.expose_secret().to_string());
            }
            data
        };

        let databases = future::try_join_all(config.databases.iter().map(|db| async move {
            cluster.ensure_database(db).await?;
            self.sink
                .emit(StreamMessage::new(
                    EventType::Changed,
                    format!("Database {} ready", db),
                ))
                .await;
            Ok::<(), EngineError>(())
        }));

        let workflow_template = async {
            if let Some(template) = &config.workflow_template {
                let mut data = BTreeMap::new();
                data.insert("template".to_string(), template.clone());
                cluster
                    .upsert_config(&ci_ns, &format!("{}-build-template", app), data)
                    .await?;
            }
            Ok::<(), EngineError>(())
        };

        let ci_token_name = format!("{}-ci-token", app);
        tokio::try_join!(
            cluster.upsert_secret(&namespace, "app-tls", material.tls.expose()),
            cluster.upsert_secret(&namespace, "registry-pull", material.registry.expose()),
            cluster.upsert_secret(&namespace, "db-credentials", db_credentials),
            cluster.upsert_secret(&ci_ns, &ci_token_name, material.ci_token.expose()),
            cluster.upsert_secret(&namespace, "ci-token", material.ci_token.expose()),
            cluster.upsert_secret(&namespace, "tracking-config", tracking_config),
            cluster.upsert_app_record(AppRecord {
                name: app.clone(),
                template: self.deployment.template.name.clone(),
                owner: self.deployment.created_by.clone(),
            }),
            databases,
            workflow_template,
        )?;

        self.sink
            .emit(StreamMessage::new(EventType::Ok, "Created application resources"))
            .await;
        Ok(())
    }

    /// Phase 4: migrations, webhook, push, then wait for and monitor the
    /// CI build. Strictly sequential.
    async fn git_handoff_and_monitor(
        &self,
        worktree: &Path,
        config: &PlatformConfig,
    ) -> Result<(), EngineError> {
        self.phase(4, "Git handoff and build monitoring").await;

        self.run_automation(InvocationKind::OptionalComponent, MIGRATIONS_PLAYBOOK, worktree)
            .await?;

        self.configure_webhook(config).await?;

        let org = self.settings.git.organization.as_str();
        let app = self.deployment.name.as_str();
        self.platform
            .githost
            .push(
                org,
                app,
                worktree,
                &format!(
                    "Deploy {} from template {}",
                    app, self.deployment.template.name
                ),
            )
            .await?;
        self.sink
            .emit(StreamMessage::new(
                EventType::Ok,
                format!("Pushed rendered tree to {}/{}", org, app),
            ))
            .await;

        let build = self.wait_for_build_trigger().await?;
        self.monitor_build(&build).await
    }

    /// Configure the push webhook exactly once: delete every hook with the
    /// same callback URL, then create one.
    async fn configure_webhook(&self, config: &PlatformConfig) -> Result<(), EngineError> {
        let org = self.settings.git.organization.as_str();
        let app = self.deployment.name.as_str();
        let callback = format!(
            "{}{}",
            self.settings.git.callback_base.trim_end_matches('/'),
            config.webhook_path
        );

        let hooks = self.platform.githost.list_webhooks(org, app).await?;
        for hook in hooks.iter().filter(|h| h.url == callback) {
            debug!("Removing stale webhook {} on {}/{}", hook.id, org, app);
            self.platform.githost.delete_webhook(org, app, hook.id).await?;
        }
        self.platform.githost.create_webhook(org, app, &callback).await?;

        self.sink
            .emit(StreamMessage::new(
                EventType::Ok,
                format!("Webhook configured for {}", callback),
            ))
            .await;
        Ok(())
    }

    /// Poll until the CI system reports a triggered build, bounded by the
    /// trigger timeout. Exceeding the timeout is a hard failure.
    async fn wait_for_build_trigger(&self) -> Result<String, EngineError> {
        let timeout = self.settings.ci.trigger_timeout();
        let poll = self.settings.ci.poll_interval();
        let deadline = tokio::time::Instant::now() + timeout;
        let app = self.deployment.name.as_str();

        self.sink
            .emit(StreamMessage::new(
                EventType::Task,
                format!("Waiting for CI build of {}", app),
            ))
            .await;

        loop {
            if let Some(name) = self.platform.ci.find_build(app).await? {
                self.sink
                    .emit(StreamMessage::new(
                        EventType::Ok,
                        format!("Build {} triggered", name),
                    ))
                    .await;
                return Ok(name);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::BuildTimeout(format!(
                    "no CI build observed for {} within {}s",
                    app,
                    timeout.as_secs()
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    /// Poll the build until it reaches a terminal phase, announcing each
    /// node exactly once. Unbounded by design, but cancellable.
    async fn monitor_build(&self, build: &str) -> Result<(), EngineError> {
        let poll = self.settings.ci.poll_interval();
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            let status = self.platform.ci.build_status(build).await?;

            for node in &status.nodes {
                if seen.insert(node.id.clone()) {
                    self.sink
                        .emit(StreamMessage::new(
                            EventType::Output,
                            format!("Build step {}: {:?}", node.display_name, node.phase),
                        ))
                        .await;
                }
            }

            match status.phase {
                BuildPhase::Succeeded => {
                    self.sink
                        .emit(StreamMessage::new(
                            EventType::Ok,
                            format!("Build {} succeeded", build),
                        ))
                        .await;
                    return Ok(());
                }
                BuildPhase::Failed | BuildPhase::Error => {
                    return Err(EngineError::ExternalError(
                        status
                            .message
                            .unwrap_or_else(|| format!("build {} failed", build)),
                    ));
                }
                _ => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    /// Phase 5: register the GitOps application, optional pipeline
    /// monitoring metadata, and the service-discovery record.
    async fn register_deployment(
        &self,
        material: &GatheredMaterial,
        config: &PlatformConfig,
    ) -> Result<(), EngineError> {
        self.phase(5, "Deployment and discovery").await;

        let namespace = self.namespace()?.to_string();
        let app = self.deployment.name.clone();
        let org = self.settings.git.organization.as_str();
        let repo_url = format!("{}/{}/{}.git", self.settings.git.api_base, org, app);
        let cluster = &self.platform.cluster;

        cluster
            .upsert_secret(&namespace, "gitops-repo-credentials", material.gitops.expose())
            .await?;

        cluster
            .upsert_gitops_app(GitopsApp {
                name: app.clone(),
                namespace: namespace.clone(),
                repo_url,
                revision: "main".to_string(),
            })
            .await?;

        if config.pipeline_monitoring {
            let mut data = BTreeMap::new();
            data.insert("app".to_string(), app.clone());
            data.insert("namespace".to_string(), namespace.clone());
            cluster
                .upsert_config(&namespace, "pipeline-monitor", data)
                .await?;
        }

        let url = match self.deployment.variable("domain") {
            Some(domain) => format!("https://{}.{}", app, domain),
            None => format!("http://{}.{}.svc", app, namespace),
        };
        cluster
            .upsert_service_record(ServiceRecord {
                name: app.clone(),
                namespace,
                url,
            })
            .await?;

        self.sink
            .emit(StreamMessage::new(
                EventType::Ok,
                format!("Application {} registered", app),
            ))
            .await;
        Ok(())
    }

    /// Variables handed to every automation invocation
    fn automation_variables(&self, worktree: &Path) -> HashMap<String, serde_json::Value> {
        let mut vars = self.deployment.variables.clone();
        vars.insert("app_name".to_string(), serde_json::json!(self.deployment.name));
        vars.insert(
            "template".to_string(),
            serde_json::json!(self.deployment.template.name),
        );
        vars.insert(
            "template_version".to_string(),
            serde_json::json!(self.deployment.template.version),
        );
        vars.insert(
            "worktree".to_string(),
            serde_json::json!(worktree.display().to_string()),
        );
        vars
    }

    /// Run one automation invocation, streaming classified output lines.
    async fn run_automation(
        &self,
        kind: InvocationKind,
        playbook: &str,
        worktree: &Path,
    ) -> Result<(), EngineError> {
        let variables = self.automation_variables(worktree);
        let ctx = ContextBuilder::new(&self.settings.automation)
            .build(kind, playbook, worktree, &variables)?;

        let mut runner = ProcessRunner::spawn(
            &ctx,
            self.process.clone(),
            self.cancel.child_token(),
            self.settings.automation.kill_grace(),
        )?;

        let mut current_task: Option<(String, u32)> = None;
        let mut task_count: u32 = 0;

        while let Some(event) = runner.next_event().await {
            match event {
                RunnerEvent::Line(line) => {
                    let event_type = classify(&line);
                    if event_type == EventType::Task {
                        if let Some(name) = task_name(&line) {
                            task_count += 1;
                            current_task = Some((name, task_count));
                        }
                    }
                    let message = match &current_task {
                        Some((name, number)) => {
                            StreamMessage::for_task(event_type, line, name.clone(), *number)
                        }
                        None => StreamMessage::new(event_type, line),
                    };
                    self.sink.emit(message).await;
                }
                RunnerEvent::Exited(code) => {
                    if self.cancel.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    if code != 0 {
                        return Err(EngineError::ProcessError(format!(
                            "{} exited with status {}",
                            self.settings.automation.command, code
                        )));
                    }
                    return Ok(());
                }
            }
        }

        Err(EngineError::ProcessError(
            "process event stream ended unexpectedly".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::template::TemplateRef;
    use crate::platform::memory::{MemoryCi, MemoryCluster, MemoryGitHost};
    use crate::platform::GitHostApi;
    use crate::storage::memory::MemoryLogStore;
    use crate::storage::LogStore;

    fn services(cluster: Arc<MemoryCluster>, githost: Arc<MemoryGitHost>, ci: Arc<MemoryCi>) -> PlatformServices {
        PlatformServices {
            cluster,
            githost,
            ci,
        }
    }

    fn provisioner(deployment: Deployment, platform: PlatformServices) -> Provisioner {
        let logs = Arc::new(MemoryLogStore::new());
        let sink = Arc::new(EventSink::new(deployment.id.clone(), logs, 16 * 1024, 0));
        Provisioner::new(
            deployment,
            Arc::new(Settings::default()),
            platform,
            sink,
            Arc::new(ProcessHandle::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_missing_required_variable_fails_validation() {
        let deployment = Deployment::new(
            "shop",
            TemplateRef::new("fastapi-postgres"),
            HashMap::new(), // no namespace
            "alice",
        );
        let platform = services(
            Arc::new(MemoryCluster::new()),
            Arc::new(MemoryGitHost::new()),
            Arc::new(MemoryCi::idle()),
        );

        let err = provisioner(deployment, platform).run().await.unwrap_err();
        match err {
            EngineError::ValidationError(msg) => assert!(msg.contains("namespace")),
            other => panic!("expected ValidationError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blank_git_token_is_a_config_error() {
        let cluster = Arc::new(MemoryCluster::new());
        let settings = Settings::default();
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
            .seed_secret(
                &settings.ci.namespace,
                "ci-token",
                SecretMaterial::from_pairs([("token", "ci")]),
            )
            .await;
        // Present but blank: as unusable as a missing entry.
        cluster
            .seed_secret(ns, "git-credentials", SecretMaterial::from_pairs([("token", "")]))
            .await;

        let deployment = Deployment::new(
            "shop",
            TemplateRef::new("fastapi-postgres"),
            HashMap::new(),
            "alice",
        );
        let platform = services(cluster, Arc::new(MemoryGitHost::new()), Arc::new(MemoryCi::idle()));
        let p = provisioner(deployment, platform);

        let worktree = tempfile::tempdir().unwrap();
        let err = p.gather_resources(worktree.path()).await.unwrap_err();
        match err {
            EngineError::ConfigError(msg) => assert!(msg.contains("token")),
            other => panic!("expected ConfigError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_webhook_configured_exactly_once() {
        let githost = Arc::new(MemoryGitHost::new());
        githost.ensure_repository("deployments", "shop").await.unwrap();

        let deployment = Deployment::new(
            "shop",
            TemplateRef::new("fastapi-postgres"),
            HashMap::new(),
            "alice",
        );
        let platform = services(
            Arc::new(MemoryCluster::new()),
            githost.clone(),
            Arc::new(MemoryCi::idle()),
        );
        let p = provisioner(deployment, platform);

        let config = PlatformConfig::default();
        for _ in 0..3 {
            p.configure_webhook(&config).await.unwrap();
        }

        let callback = format!(
            "{}{}",
            Settings::default().git.callback_base.trim_end_matches('/'),
            config.webhook_path
        );
        let hooks = githost.webhooks("deployments", "shop").await;
        let matching: Vec<_> = hooks.iter().filter(|h| h.url == callback).collect();
        assert_eq!(matching.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_trigger_timeout_is_distinct() {
        let deployment = Deployment::new(
            "shop",
            TemplateRef::new("fastapi-postgres"),
            HashMap::new(),
            "alice",
        );
        let platform = services(
            Arc::new(MemoryCluster::new()),
            Arc::new(MemoryGitHost::new()),
            Arc::new(MemoryCi::idle()),
        );

        let err = provisioner(deployment, platform)
            .wait_for_build_trigger()
            .await
            .unwrap_err();
        match err {
            EngineError::BuildTimeout(msg) => assert!(msg.contains("shop")),
            other => panic!("expected BuildTimeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_monitor_announces_each_node_once() {
        use crate::platform::{BuildNode, BuildStatus};

        let running = BuildStatus {
            name: "build-1".to_string(),
            phase: BuildPhase::Running,
            message: None,
            nodes: vec![BuildNode {
                id: "n1".to_string(),
                display_name: "compile".to_string(),
                phase: BuildPhase::Running,
            }],
        };
        let done = BuildStatus {
            name: "build-1".to_string(),
            phase: BuildPhase::Succeeded,
            message: None,
            nodes: vec![
                BuildNode {
                    id: "n1".to_string(),
                    display_name: "compile".to_string(),
                    phase: BuildPhase::Succeeded,
                },
                BuildNode {
                    id: "n2".to_string(),
                    display_name: "publish".to_string(),
                    phase: BuildPhase::Succeeded,
                },
            ],
        };
        let ci = Arc::new(MemoryCi::with_build("build-1", vec![running, done]));

        let deployment = Deployment::new(
            "shop",
            TemplateRef::new("fastapi-postgres"),
            HashMap::new(),
            "alice",
        );
        let logs = Arc::new(MemoryLogStore::new());
        let sink = Arc::new(EventSink::new(deployment.id.clone(), logs.clone(), 16 * 1024, 0));
        let p = Provisioner::new(
            deployment.clone(),
            Arc::new(Settings {
                ci: crate::storage::settings::CiSettings {
                    poll_interval: 0,
                    ..Default::default()
                },
                ..Default::default()
            }),
            services(Arc::new(MemoryCluster::new()), Arc::new(MemoryGitHost::new()), ci),
            sink,
            Arc::new(ProcessHandle::new()),
            CancellationToken::new(),
        );

        p.monitor_build("build-1").await.unwrap();

        let entries = logs.list(&deployment.id).await.unwrap();
        let compile_lines = entries
            .iter()
            .filter(|e| e.message.message.contains("compile"))
            .count();
        assert_eq!(compile_lines, 1);
        assert!(entries.iter().any(|e| e.message.message.contains("publish")));
    }
}
