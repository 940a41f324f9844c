// ABOUTME: Environment manager holding the registry of live environments
// ABOUTME: Creates, looks up, keeps alive and terminates environments sharing one port pool

use super::environment::{Environment, EnvironmentExport};
use super::orchestrator::Orchestrator;
use crate::error::{EngineError, Result};
use crate::params::TemplateInfo;
use crate::request::{validate_templates, EnvironmentRequest, TemplateRequest};
use crate::resolve::PortPool;
use crate::sandbox::{DirTemplateLoader, TemplateExecutor, TemplateLoader};
use envforge_config::EngineSettings;
use envforge_runtime::ContainerRuntime;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

type Registry = Arc<RwLock<HashMap<String, Arc<Environment>>>>;

/// Environment lifecycle manager
pub struct EnvironmentManager {
    settings: EngineSettings,
    runtime: Arc<dyn ContainerRuntime>,
    orchestrator: Orchestrator,
    ports: Arc<PortPool>,
    environments: Registry,
}

impl EnvironmentManager {
    pub fn new(
        settings: EngineSettings,
        runtime: Arc<dyn ContainerRuntime>,
        loader: Arc<dyn TemplateLoader>,
    ) -> Result<Self> {
        settings.validate()?;

        let executor = TemplateExecutor::new(loader, &settings);
        Ok(Self {
            orchestrator: Orchestrator::new(executor, &settings),
            ports: Arc::new(PortPool::from_settings(&settings)),
            runtime,
            settings,
            environments: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Manager reading templates from `settings.template_dir`
    pub fn from_settings(settings: EngineSettings, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let loader = Arc::new(DirTemplateLoader::new(settings.template_dir.clone()));
        Self::new(settings, runtime, loader)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn port_pool(&self) -> &Arc<PortPool> {
        &self.ports
    }

    /// Build a new environment and wait until it is ready.
    ///
    /// The environment is registered while it is being built so it can be
    /// terminated concurrently. A failed environment is unregistered.
    pub async fn create(&self, request: EnvironmentRequest) -> Result<Arc<Environment>> {
        request.validate()?;

        let keep_alive = request
            .keep_alive()
            .or_else(|| self.settings.default_keep_alive());

        let env = Arc::new(Environment::new(
            &request.name,
            &request.description,
            &self.settings.external_address,
            keep_alive,
            self.runtime.clone(),
            self.ports.clone(),
        ));

        self.environments
            .write()
            .await
            .insert(env.id().to_string(), env.clone());
        info!("Creating environment {}", env.id());

        if let Err(e) = self.orchestrator.build(&env, &request).await {
            self.environments.write().await.remove(env.id());
            return Err(e);
        }

        if keep_alive.is_some() {
            env.keep_alive().await;
            self.spawn_watchdog(env.clone());
        }

        Ok(env)
    }

    /// Terminate `env` once it has not been kept alive for its keep-alive period
    fn spawn_watchdog(&self, env: Arc<Environment>) {
        let environments = self.environments.clone();

        tokio::spawn(async move {
            loop {
                let Some(deadline) = env.expires_at().await else {
                    return;
                };

                tokio::select! {
                    _ = env.cancellation().cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }

                match env.expires_at().await {
                    Some(current) if current > tokio::time::Instant::now() => continue,
                    _ => break,
                }
            }

            warn!("Environment {} missed its keep-alive, terminating", env.id());
            if let Err(e) = env.terminate().await {
                error!("Failed to terminate expired environment {}: {}", env.id(), e);
            }
            environments.write().await.remove(env.id());
        });
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Environment>> {
        self.environments
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("environment {}", id)))
    }

    /// Summaries of every registered environment, ordered by id
    pub async fn list(&self) -> Vec<EnvironmentExport> {
        let environments: Vec<Arc<Environment>> =
            self.environments.read().await.values().cloned().collect();

        let mut exports = Vec::with_capacity(environments.len());
        for env in environments {
            exports.push(env.export().await);
        }
        exports.sort_by(|a, b| a.id.cmp(&b.id));
        exports
    }

    pub async fn terminate(&self, id: &str) -> Result<()> {
        let env = self.get(id).await?;
        env.terminate().await?;
        self.environments.write().await.remove(id);
        Ok(())
    }

    /// Add templates to a ready environment and wait for their containers.
    ///
    /// Existing containers keep running and are visible to the new templates'
    /// placeholders. A failure leaves the environment as it was.
    pub async fn apply_templates(
        &self,
        id: &str,
        templates: Vec<TemplateRequest>,
    ) -> Result<EnvironmentExport> {
        validate_templates(&templates)?;
        let env = self.get(id).await?;

        self.orchestrator.apply(&env, &templates).await?;
        Ok(env.export().await)
    }

    pub async fn keep_alive(&self, id: &str) -> Result<()> {
        let env = self.get(id).await?;
        if env.state().await.is_closing() {
            return Err(EngineError::NotFound(format!("environment {}", id)));
        }
        env.keep_alive().await;
        Ok(())
    }

    /// Metadata of every template available to the manager
    pub async fn templates(&self) -> Result<BTreeMap<String, TemplateInfo>> {
        let executor = self.orchestrator.executor().clone();
        tokio::task::spawn_blocking(move || executor.catalogue())
            .await
            .map_err(|e| EngineError::Request(format!("template listing failed: {}", e)))?
    }

    /// Terminate every registered environment
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.environments.read().await.keys().cloned().collect();
        info!("Shutting down {} environments", ids.len());

        for id in ids {
            if let Err(e) = self.terminate(&id).await {
                error!("Failed to terminate environment {}: {}", id, e);
            }
        }
    }
}
