// ABOUTME: Drives one environment from request to Ready: execute, merge, fetch, allocate, resolve, run, probe
// ABOUTME: A failed build tears everything down, a failed template addition rolls back only its own resources

use super::environment::{failure_summary, Environment};
use super::state::EnvironmentState;
use crate::error::{EngineError, Result};
use crate::model::{MergedModel, TemplateModel};
use crate::readiness::{ContainerChecks, ContainerState, ReadinessOutcome, WaitMode};
use crate::request::{EnvironmentRequest, TemplateRequest};
use crate::resolve::{
    resolve_containers, resolve_images, ResolvedContainer, ResolvedEnvironment, ResolvedImage,
};
use crate::sandbox::{Invocation, TemplateExecutor};
use envforge_config::EngineSettings;
use futures::future::{join_all, try_join_all};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct Orchestrator {
    executor: TemplateExecutor,
    build_timeout: Duration,
}

impl Orchestrator {
    pub fn new(executor: TemplateExecutor, settings: &EngineSettings) -> Self {
        Self {
            executor,
            build_timeout: settings.build_timeout(),
        }
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn executor(&self) -> &TemplateExecutor {
        &self.executor
    }

    /// Run `construct` under the environment's cancellation and the build deadline
    async fn guarded(
        &self,
        env: &Environment,
        templates: &[TemplateRequest],
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled(env.id().to_string())),
            built = tokio::time::timeout(self.build_timeout, self.construct(env, templates, cancel)) => {
                match built {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Deadline {
                        env_id: env.id().to_string(),
                        timeout: self.build_timeout,
                    }),
                }
            }
        }
    }

    /// Construct `env` from `request`, leaving it `Ready` or `Failed`.
    ///
    /// On error every resource created so far has been released before
    /// the error is returned.
    pub async fn build(&self, env: &Environment, request: &EnvironmentRequest) -> Result<()> {
        let _construction = env.build_lock.lock().await;

        if env.state().await.is_closing() {
            return Err(EngineError::Cancelled(env.id().to_string()));
        }

        info!(
            "[{}] Building environment from {} templates",
            env.id(),
            request.templates.len()
        );

        let result = match self
            .guarded(env, &request.templates, env.cancellation())
            .await
        {
            Ok(()) if env.transition(EnvironmentState::Ready).await => {
                info!("[{}] Environment is ready", env.id());
                return Ok(());
            }
            Ok(()) => Err(EngineError::Cancelled(env.id().to_string())),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            log_failure(env, e, "Construction");
            env.cancellation().cancel();
            env.fail(e).await;
            env.teardown().await;
        }
        result
    }

    /// Add `templates` to a ready environment, starting only their containers.
    ///
    /// On error the resources created for the new templates are released and
    /// the environment keeps running as before.
    pub async fn apply(&self, env: &Environment, templates: &[TemplateRequest]) -> Result<()> {
        let _construction = env.build_lock.lock().await;

        if env.state().await != EnvironmentState::Ready {
            return Err(EngineError::Request(format!(
                "environment {} is not ready",
                env.id()
            )));
        }

        info!("[{}] Adding {} templates", env.id(), templates.len());

        let mark = env.mark().await;
        let model = env.model().await;
        let resolved = env.resolved().await;
        let cancel = env.cancellation().child_token();

        let result = self.guarded(env, templates, &cancel).await;
        if let Err(e) = &result {
            log_failure(env, e, "Adding templates");
            cancel.cancel();
            env.rollback(mark).await;
            env.set_model(model).await;
            env.set_resolved(resolved).await;
        } else {
            info!("[{}] Templates added", env.id());
        }
        result
    }

    async fn construct(
        &self,
        env: &Environment,
        templates: &[TemplateRequest],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let instances = env.reserve_instances(templates).await;
        let models = self.execute_templates(templates, instances, cancel).await?;

        let mut model = env.model().await;
        let mut addition = MergedModel::merge_onto(&model, env.id(), models)?;
        debug!(
            "[{}] Merged model: {} new images, {} new containers",
            env.id(),
            addition.images.len(),
            addition.containers.len()
        );

        let images = resolve_images(&addition.images)?;
        self.prepare_images(env, &addition, &images).await?;
        self.expose_image_ports(env, &mut addition).await;

        let ports = env.port_pool().allocate(&addition)?;
        env.record_ports(&ports).await;

        let added: Vec<String> = addition
            .containers
            .iter()
            .map(|c| c.decl.name.clone())
            .collect();
        let names: Vec<&str> = added.iter().map(String::as_str).collect();

        model.append(addition);
        let containers = resolve_containers(
            &model,
            &names,
            &env.port_allocation().await,
            env.external_address(),
            env.id(),
        )?;

        env.set_model(model).await;
        let mut resolved = env.resolved().await;
        resolved.extend(ResolvedEnvironment {
            images,
            containers: containers.clone(),
        });
        env.set_resolved(resolved).await;
        for container in &containers {
            env.board().set(&container.name, ContainerState::NotStarted).await;
        }

        env.ensure_network().await?;
        self.start_containers(env, &containers).await?;

        let checks = containers
            .iter()
            .map(|c| ContainerChecks {
                name: c.name.clone(),
                checks: c.checks.clone(),
            })
            .collect();

        match env
            .readiness()
            .wait_all(checks, WaitMode::UntilReady, cancel)
            .await
        {
            ReadinessOutcome::Ready => Ok(()),
            ReadinessOutcome::Failed(failures) => Err(EngineError::Readiness(failures)),
            ReadinessOutcome::Cancelled => Err(EngineError::Cancelled(env.id().to_string())),
        }
    }

    /// Run every requested template on the blocking pool, results in request order
    async fn execute_templates(
        &self,
        templates: &[TemplateRequest],
        instances: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TemplateModel>> {
        let tasks: Vec<_> = templates
            .iter()
            .zip(instances)
            .map(|(requested, instance)| {
                let invocation = Invocation {
                    template: requested.template.clone(),
                    version: requested.version.clone(),
                    parameters: requested.parameters.clone(),
                    instance,
                };

                let executor = self.executor.clone();
                let cancel = cancel.clone();
                async move {
                    let template = invocation.template.clone();
                    tokio::task::spawn_blocking(move || executor.execute(&invocation, &cancel))
                        .await
                        .map_err(|e| {
                            EngineError::template(template, format!("execution task failed: {}", e))
                        })?
                }
            })
            .collect();

        try_join_all(tasks).await
    }

    async fn prepare_images(
        &self,
        env: &Environment,
        model: &MergedModel,
        images: &[ResolvedImage],
    ) -> Result<()> {
        let runtime = env.runtime();

        let fetches = model.fetched_references().into_iter().map(|reference| async move {
            debug!("[{}] Fetching image {}", env.id(), reference);
            runtime.fetch_image(reference).await?;
            Ok::<_, EngineError>(())
        });

        let builds = images
            .iter()
            .filter_map(|image| image.build.as_ref().map(|context| (image, context)))
            .map(|(image, context)| async move {
                env.record_image(&image.tag).await;
                info!(
                    "[{}] Building image {} for {} ({})",
                    env.id(),
                    image.tag,
                    image.template,
                    image.instance
                );
                runtime.build_image(context).await?;
                Ok::<_, EngineError>(())
            });

        tokio::try_join!(try_join_all(fetches), try_join_all(builds))?;
        Ok(())
    }

    /// Containers without declared ports expose what their image exposes
    async fn expose_image_ports(&self, env: &Environment, model: &mut MergedModel) {
        let runtime = env.runtime();

        let lookups = model.portless_images().into_iter().map(|tag| async move {
            match runtime.image_ports(tag).await {
                Ok(ports) => Some((tag.to_string(), ports)),
                Err(e) => {
                    warn!("[{}] Error getting exposed ports for {}: {}", env.id(), tag, e);
                    None
                }
            }
        });

        let image_ports: HashMap<String, Vec<u16>> =
            join_all(lookups).await.into_iter().flatten().collect();
        for (tag, ports) in &image_ports {
            if !ports.is_empty() {
                debug!("[{}] Image {} exposes {:?}", env.id(), tag, ports);
            }
        }

        model.expose_image_ports(&image_ports);
    }

    async fn start_containers(&self, env: &Environment, containers: &[ResolvedContainer]) -> Result<()> {
        let runtime = env.runtime();

        try_join_all(containers.iter().map(|container| async move {
            env.record_container(&container.name, &container.spec.name).await;
            let id = runtime.create_container(&container.spec).await?;
            env.record_container_id(&container.name, &id).await;

            env.record_started(&container.name, true).await;
            runtime.start_container(&id).await?;
            env.board().set(&container.name, ContainerState::Started).await;

            info!(
                "[{}] Started container {} ({})",
                env.id(),
                container.name,
                container.spec.image
            );
            Ok::<_, EngineError>(())
        }))
        .await?;
        Ok(())
    }
}

fn log_failure(env: &Environment, e: &EngineError, stage: &str) {
    match e {
        EngineError::Readiness(failures) => error!(
            "[{}] Containers failed readiness: {}",
            env.id(),
            failure_summary(failures)
        ),
        EngineError::Cancelled(_) => warn!("[{}] {} cancelled", env.id(), stage),
        other => error!("[{}] {} failed: {}", env.id(), stage, other),
    }
}
