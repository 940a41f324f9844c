// ABOUTME: A single environment: identity, lifecycle state, resource ledger and operations
// ABOUTME: Owns teardown of containers, built images and host ports, and the export summary

use super::state::EnvironmentState;
use crate::error::{EngineError, ReadinessFailures, Result};
use crate::readiness::{
    ContainerChecks, ContainerState, ReadinessBoard, ReadinessEngine, ReadinessOutcome, WaitMode,
};
use crate::model::MergedModel;
use crate::request::TemplateRequest;
use crate::resolve::{network_name, PortAllocation, PortPool, ResolvedEnvironment};
use chrono::{DateTime, Utc};
use envforge_runtime::ContainerRuntime;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// `<name>-<yyyymmddHHMMSS>-<random>`
pub fn environment_id(name: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        name,
        now.format("%Y%m%d%H%M%S"),
        nanoid::nanoid!(8, &ID_ALPHABET)
    )
}

#[derive(Debug, Clone)]
struct LedgerContainer {
    name: String,
    /// Runtime name, usable as an id before creation completes
    runtime_name: String,
    id: Option<String>,
    started: bool,
}

/// Runtime resources owned by an environment, recorded before each runtime call
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    containers: Vec<LedgerContainer>,
    images: Vec<String>,
    ports: PortAllocation,
    network: Option<String>,
}

/// Ledger position to roll back to when adding templates fails
#[derive(Debug, Clone)]
pub(crate) struct LedgerMark {
    containers: usize,
    images: usize,
    port_owners: HashSet<String>,
}

impl Ledger {
    fn container_mut(&mut self, name: &str) -> Option<&mut LedgerContainer> {
        self.containers.iter_mut().find(|c| c.name == name)
    }

    fn handle(&self, name: &str) -> Option<String> {
        self.containers
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id.clone().unwrap_or_else(|| c.runtime_name.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedContainer {
    pub id: Option<String>,
    pub hostname: String,
    /// internal port -> `host:port`
    pub ports: BTreeMap<u16, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedInstance {
    pub instance: String,
    pub containers: BTreeMap<String, ExportedContainer>,
}

/// Serializable summary of an environment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentExport {
    pub id: String,
    pub name: String,
    pub description: String,
    pub state: EnvironmentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub created_at: DateTime<Utc>,
    /// template name -> one entry per invocation
    pub templates: BTreeMap<String, Vec<ExportedInstance>>,
}

pub struct Environment {
    id: String,
    name: String,
    description: String,
    created_at: DateTime<Utc>,
    external_address: String,
    keep_alive: Option<Duration>,
    state: RwLock<EnvironmentState>,
    cause: RwLock<Option<String>>,
    ledger: Mutex<Ledger>,
    model: RwLock<MergedModel>,
    resolved: RwLock<ResolvedEnvironment>,
    /// Invocations so far per template name
    invocations: Mutex<HashMap<String, usize>>,
    last_seen: Mutex<Instant>,
    /// Held while the environment is being constructed
    pub(crate) build_lock: Mutex<()>,
    cancel: CancellationToken,
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortPool>,
    board: ReadinessBoard,
}

impl Environment {
    pub(crate) fn new(
        name: &str,
        description: &str,
        external_address: &str,
        keep_alive: Option<Duration>,
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<PortPool>,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: environment_id(name, created_at),
            name: name.to_string(),
            description: description.to_string(),
            created_at,
            external_address: external_address.to_string(),
            keep_alive,
            state: RwLock::new(EnvironmentState::Pending),
            cause: RwLock::new(None),
            ledger: Mutex::new(Ledger::default()),
            model: RwLock::new(MergedModel::default()),
            resolved: RwLock::new(ResolvedEnvironment::default()),
            invocations: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(Instant::now()),
            build_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            runtime,
            ports,
            board: ReadinessBoard::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn keep_alive_period(&self) -> Option<Duration> {
        self.keep_alive
    }

    pub async fn state(&self) -> EnvironmentState {
        *self.state.read().await
    }

    /// Why the environment failed, if it did
    pub async fn cause(&self) -> Option<String> {
        self.cause.read().await.clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub(crate) fn board(&self) -> &ReadinessBoard {
        &self.board
    }

    pub(crate) fn readiness(&self) -> ReadinessEngine {
        ReadinessEngine::new(self.id.clone(), self.runtime.clone(), self.board.clone())
    }

    pub(crate) fn external_address(&self) -> &str {
        &self.external_address
    }

    pub(crate) fn port_pool(&self) -> &Arc<PortPool> {
        &self.ports
    }

    pub async fn container_readiness(&self) -> BTreeMap<String, ContainerState> {
        self.board.snapshot().await
    }

    /// Move to `next` if the lifecycle allows it
    pub(crate) async fn transition(&self, next: EnvironmentState) -> bool {
        let mut state = self.state.write().await;
        if !state.can_transition_to(next) {
            debug!("[{}] Ignoring transition {} -> {}", self.id, *state, next);
            return false;
        }
        info!("[{}] {} -> {}", self.id, *state, next);
        *state = next;
        true
    }

    pub(crate) async fn fail(&self, cause: &EngineError) {
        if self.transition(EnvironmentState::Failed).await {
            *self.cause.write().await = Some(cause.to_string());
        }
    }

    /// Instance ids for `templates`, continuing the count of earlier invocations
    pub(crate) async fn reserve_instances(&self, templates: &[TemplateRequest]) -> Vec<String> {
        let mut invocations = self.invocations.lock().await;
        templates
            .iter()
            .map(|requested| {
                let counter = invocations.entry(requested.template.clone()).or_insert(0);
                let instance = counter.to_string();
                *counter += 1;
                instance
            })
            .collect()
    }

    pub(crate) async fn model(&self) -> MergedModel {
        self.model.read().await.clone()
    }

    pub(crate) async fn set_model(&self, model: MergedModel) {
        *self.model.write().await = model;
    }

    pub(crate) async fn record_ports(&self, allocation: &PortAllocation) {
        self.ledger.lock().await.ports.merge(allocation);
    }

    /// Every host port leased by the environment so far
    pub(crate) async fn port_allocation(&self) -> PortAllocation {
        self.ledger.lock().await.ports.clone()
    }

    /// Create the environment network unless it already exists
    pub(crate) async fn ensure_network(&self) -> Result<()> {
        let name = network_name(&self.id);
        {
            let mut ledger = self.ledger.lock().await;
            if ledger.network.is_some() {
                return Ok(());
            }
            ledger.network = Some(name.clone());
        }

        let network_id = self.runtime.create_network(&name).await?;
        debug!("[{}] Created network {} ({})", self.id, name, network_id);
        Ok(())
    }

    pub(crate) async fn mark(&self) -> LedgerMark {
        let ledger = self.ledger.lock().await;
        LedgerMark {
            containers: ledger.containers.len(),
            images: ledger.images.len(),
            port_owners: ledger.ports.containers().map(str::to_string).collect(),
        }
    }

    /// Release everything recorded after `mark`
    pub(crate) async fn rollback(&self, mark: LedgerMark) {
        let (containers, images, ports) = {
            let mut ledger = self.ledger.lock().await;
            let at = mark.containers.min(ledger.containers.len());
            let containers = ledger.containers.split_off(at);
            let at = mark.images.min(ledger.images.len());
            let images = ledger.images.split_off(at);
            let ports = ledger.ports.split_off(&mark.port_owners);
            (containers, images, ports)
        };

        info!(
            "[{}] Rolling back {} containers and {} built images",
            self.id,
            containers.len(),
            images.len()
        );
        self.release(&containers, &images).await;
        self.ports.release(&ports);
        for container in &containers {
            self.board.remove(&container.name).await;
        }
    }

    pub(crate) async fn record_image(&self, tag: &str) {
        self.ledger.lock().await.images.push(tag.to_string());
    }

    pub(crate) async fn record_container(&self, name: &str, runtime_name: &str) {
        self.ledger.lock().await.containers.push(LedgerContainer {
            name: name.to_string(),
            runtime_name: runtime_name.to_string(),
            id: None,
            started: false,
        });
    }

    pub(crate) async fn record_container_id(&self, name: &str, id: &str) {
        if let Some(container) = self.ledger.lock().await.container_mut(name) {
            container.id = Some(id.to_string());
        }
    }

    pub(crate) async fn record_started(&self, name: &str, started: bool) {
        if let Some(container) = self.ledger.lock().await.container_mut(name) {
            container.started = started;
        }
    }

    pub(crate) async fn resolved(&self) -> ResolvedEnvironment {
        self.resolved.read().await.clone()
    }

    pub(crate) async fn set_resolved(&self, resolved: ResolvedEnvironment) {
        *self.resolved.write().await = resolved;
    }

    /// Release every recorded resource. Failures are logged, never returned.
    pub(crate) async fn teardown(&self) {
        let ledger = std::mem::take(&mut *self.ledger.lock().await);
        if ledger.containers.is_empty()
            && ledger.images.is_empty()
            && ledger.ports.is_empty()
            && ledger.network.is_none()
        {
            return;
        }

        info!(
            "[{}] Tearing down {} containers and {} built images",
            self.id,
            ledger.containers.len(),
            ledger.images.len()
        );

        self.release(&ledger.containers, &ledger.images).await;

        if let Some(network) = &ledger.network {
            if let Err(e) = self.runtime.remove_network(network).await {
                warn!("[{}] Failed to remove network {}: {}", self.id, network, e);
            }
        }

        if !ledger.ports.is_empty() {
            self.ports.release(&ledger.ports);
            debug!("[{}] Released {} host ports", self.id, ledger.ports.len());
        }
    }

    /// Stop and remove `containers`, then remove `images`
    async fn release(&self, containers: &[LedgerContainer], images: &[String]) {
        let runtime = &self.runtime;
        join_all(containers.iter().rev().map(|container| async move {
            let handle = container.id.as_deref().unwrap_or(&container.runtime_name);
            if container.started {
                if let Err(e) = runtime.stop_container(handle).await {
                    warn!("[{}] Failed to stop container {}: {}", self.id, container.name, e);
                }
            }
            if let Err(e) = runtime.remove_container(handle).await {
                error!("[{}] Failed to remove container {}: {}", self.id, container.name, e);
            }
        }))
        .await;

        for tag in images {
            if let Err(e) = runtime.remove_image(tag).await {
                warn!("[{}] Failed to remove image {}: {}", self.id, tag, e);
            }
        }
    }

    /// Tear the environment down. Calling it again is a no-op.
    ///
    /// Safe while construction or probing is in progress: the environment is
    /// marked `TearingDown` and cancelled first, and teardown waits for the
    /// construction task to stop.
    pub async fn terminate(&self) -> Result<()> {
        if !self.transition(EnvironmentState::TearingDown).await {
            debug!("[{}] Already tearing down or terminated", self.id);
            return Ok(());
        }

        self.cancel.cancel();
        let _construction = self.build_lock.lock().await;

        self.teardown().await;
        self.transition(EnvironmentState::Terminated).await;
        info!("[{}] Environment terminated", self.id);
        Ok(())
    }

    /// Reset the keep-alive timer
    pub async fn keep_alive(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    /// Instant after which the watchdog terminates the environment
    pub(crate) async fn expires_at(&self) -> Option<Instant> {
        let period = self.keep_alive?;
        Some(*self.last_seen.lock().await + period)
    }

    async fn ready_checks(&self, names: &[String]) -> Result<Vec<(String, String, ContainerChecks)>> {
        if self.state().await != EnvironmentState::Ready {
            return Err(EngineError::Request(format!(
                "environment {} is not ready",
                self.id
            )));
        }

        let resolved = self.resolved.read().await;
        let ledger = self.ledger.lock().await;

        names
            .iter()
            .map(|name| {
                let container = resolved
                    .container(name)
                    .ok_or_else(|| {
                        EngineError::NotFound(format!("container '{}' in {}", name, self.id))
                    })?;
                let handle = ledger.handle(name).unwrap_or_else(|| container.spec.name.clone());
                Ok((
                    name.clone(),
                    handle,
                    ContainerChecks {
                        name: name.clone(),
                        checks: container.checks.clone(),
                    },
                ))
            })
            .collect()
    }

    async fn wait(&self, checks: Vec<ContainerChecks>, mode: WaitMode) -> Result<()> {
        match self.readiness().wait_all(checks, mode, &self.cancel).await {
            ReadinessOutcome::Ready => Ok(()),
            ReadinessOutcome::Failed(failures) => Err(EngineError::Readiness(failures)),
            ReadinessOutcome::Cancelled => Err(EngineError::Cancelled(self.id.clone())),
        }
    }

    /// Stop containers, then wait until their checks stop answering
    pub async fn stop_containers(&self, names: &[String]) -> Result<()> {
        let targets = self.ready_checks(names).await?;

        for (name, handle, _) in &targets {
            self.runtime.stop_container(handle).await?;
            self.record_started(name, false).await;
            info!("[{}] Stopped container {}", self.id, name);
        }

        self.wait(
            targets.into_iter().map(|(_, _, checks)| checks).collect(),
            WaitMode::UntilDown,
        )
        .await
    }

    /// Start previously stopped containers and wait for them to become ready
    pub async fn restart_containers(&self, names: &[String]) -> Result<()> {
        let targets = self.ready_checks(names).await?;

        for (name, handle, _) in &targets {
            self.runtime.start_container(handle).await?;
            self.record_started(name, true).await;
            self.board.set(name, ContainerState::Started).await;
            info!("[{}] Restarted container {}", self.id, name);
        }

        self.wait(
            targets.into_iter().map(|(_, _, checks)| checks).collect(),
            WaitMode::UntilReady,
        )
        .await
    }

    pub async fn export(&self) -> EnvironmentExport {
        let mut templates: BTreeMap<String, Vec<ExportedInstance>> = BTreeMap::new();

        {
            let resolved = self.resolved.read().await;
            let ledger = self.ledger.lock().await;

            for container in &resolved.containers {
                let instances = templates.entry(container.template.clone()).or_default();
                let at = match instances
                    .iter()
                    .position(|i| i.instance == container.instance)
                {
                    Some(at) => at,
                    None => {
                        instances.push(ExportedInstance {
                            instance: container.instance.clone(),
                            containers: BTreeMap::new(),
                        });
                        instances.len() - 1
                    }
                };

                let id = ledger
                    .containers
                    .iter()
                    .find(|c| c.name == container.name)
                    .and_then(|c| c.id.clone());

                instances[at].containers.insert(
                    container.name.clone(),
                    ExportedContainer {
                        id,
                        hostname: container.spec.hostname.clone(),
                        ports: container
                            .spec
                            .ports
                            .iter()
                            .map(|(internal, host)| {
                                (*internal, format!("{}:{}", self.external_address, host))
                            })
                            .collect(),
                    },
                );
            }
        }

        EnvironmentExport {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            state: self.state().await,
            cause: self.cause().await,
            created_at: self.created_at,
            templates,
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Summary of readiness failures for logging
pub(crate) fn failure_summary(failures: &ReadinessFailures) -> String {
    failures.containers().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_environment_id_shape() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let id = environment_id("itest", now);

        let (prefix, suffix) = id.split_at("itest-20240309140507-".len());
        assert_eq!(prefix, "itest-20240309140507-");
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
