// ABOUTME: Readiness engine that probes every container of an environment concurrently
// ABOUTME: Tracks per-container readiness state and aborts sibling probes on the first failure

use super::probe::{CheckOutcome, ResolvedCheck, WaitMode};
use crate::error::{ContainerFailure, ReadinessFailures};
use envforge_runtime::ContainerRuntime;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    NotStarted,
    Started,
    Probing,
    Ready,
    Failed,
    /// The environment aborted before this container finished probing
    Cancelled,
}

/// Readiness state of every container in one environment
#[derive(Debug, Clone, Default)]
pub struct ReadinessBoard {
    states: Arc<RwLock<BTreeMap<String, ContainerState>>>,
}

impl ReadinessBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, container: &str, state: ContainerState) {
        self.states
            .write()
            .await
            .insert(container.to_string(), state);
    }

    pub async fn remove(&self, container: &str) {
        self.states.write().await.remove(container);
    }

    pub async fn get(&self, container: &str) -> Option<ContainerState> {
        self.states.read().await.get(container).copied()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, ContainerState> {
        self.states.read().await.clone()
    }
}

/// A container and the checks that decide its readiness
#[derive(Debug, Clone)]
pub struct ContainerChecks {
    pub name: String,
    pub checks: Vec<ResolvedCheck>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessOutcome {
    Ready,
    Failed(ReadinessFailures),
    Cancelled,
}

enum ContainerOutcome {
    Ready,
    Failed(ContainerFailure),
    Cancelled,
}

async fn wait_container(
    runtime: Arc<dyn ContainerRuntime>,
    container: ContainerChecks,
    mode: WaitMode,
    cancel: CancellationToken,
) -> ContainerOutcome {
    let siblings = cancel.child_token();

    let outcomes = join_all(container.checks.iter().map(|check| {
        let runtime = runtime.clone();
        let siblings = siblings.clone();
        async move {
            let outcome = check.run(runtime.as_ref(), mode, &siblings).await;
            if matches!(outcome, CheckOutcome::Exhausted { .. }) {
                siblings.cancel();
            }
            (check, outcome)
        }
    }))
    .await;

    let mut cancelled = false;
    for (check, outcome) in outcomes {
        match outcome {
            CheckOutcome::Passed { .. } => {}
            CheckOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                return ContainerOutcome::Failed(ContainerFailure {
                    container: container.name.clone(),
                    check: check.probe.to_string(),
                    attempts,
                    last_error,
                })
            }
            CheckOutcome::Cancelled { .. } => cancelled = true,
        }
    }

    if cancelled {
        ContainerOutcome::Cancelled
    } else {
        ContainerOutcome::Ready
    }
}

/// Probes containers of one environment through the runtime
#[derive(Clone)]
pub struct ReadinessEngine {
    env_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    board: ReadinessBoard,
}

impl ReadinessEngine {
    pub fn new(env_id: impl Into<String>, runtime: Arc<dyn ContainerRuntime>, board: ReadinessBoard) -> Self {
        Self {
            env_id: env_id.into(),
            runtime,
            board,
        }
    }

    pub fn board(&self) -> &ReadinessBoard {
        &self.board
    }

    /// Probe every container concurrently until all pass, one fails or `cancel` fires.
    ///
    /// The first failing container cancels the probes of all others; every
    /// container that exhausted its checks is reported.
    pub async fn wait_all(
        &self,
        containers: Vec<ContainerChecks>,
        mode: WaitMode,
        cancel: &CancellationToken,
    ) -> ReadinessOutcome {
        let probing = cancel.child_token();

        let handles: Vec<_> = containers
            .into_iter()
            .map(|container| {
                let runtime = self.runtime.clone();
                let board = self.board.clone();
                let probing = probing.clone();
                let env_id = self.env_id.clone();

                tokio::spawn(async move {
                    let name = container.name.clone();
                    if mode == WaitMode::UntilReady {
                        board.set(&name, ContainerState::Probing).await;
                    }

                    let outcome = wait_container(runtime, container, mode, probing.clone()).await;
                    match &outcome {
                        ContainerOutcome::Ready => {
                            let (state, label) = match mode {
                                WaitMode::UntilReady => (ContainerState::Ready, "ready"),
                                WaitMode::UntilDown => (ContainerState::NotStarted, "down"),
                            };
                            info!("[{}] Container {} is {}", env_id, name, label);
                            board.set(&name, state).await;
                        }
                        ContainerOutcome::Failed(failure) => {
                            warn!(
                                "[{}] Container {} failed readiness: {} after {} attempts",
                                env_id, name, failure.check, failure.attempts
                            );
                            board.set(&name, ContainerState::Failed).await;
                            probing.cancel();
                        }
                        ContainerOutcome::Cancelled => {
                            board.set(&name, ContainerState::Cancelled).await;
                        }
                    }
                    (name, outcome)
                })
            })
            .collect();

        let mut failures = Vec::new();
        let mut cancelled = false;
        for joined in join_all(handles).await {
            match joined {
                Ok((_, ContainerOutcome::Ready)) => {}
                Ok((_, ContainerOutcome::Failed(failure))) => failures.push(failure),
                Ok((_, ContainerOutcome::Cancelled)) => cancelled = true,
                Err(e) => {
                    error!("[{}] Readiness task panicked: {}", self.env_id, e);
                    cancelled = true;
                }
            }
        }

        if !failures.is_empty() {
            ReadinessOutcome::Failed(ReadinessFailures { failures })
        } else if cancelled || cancel.is_cancelled() {
            ReadinessOutcome::Cancelled
        } else {
            ReadinessOutcome::Ready
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::Probe;
    use envforge_runtime::{FakeRuntime, HttpProbeResponse};
    use std::time::Duration;

    fn net(address: &str, retry_limit: u32) -> ResolvedCheck {
        ResolvedCheck {
            probe: Probe::Net {
                protocol: "tcp".to_string(),
                address: address.to_string(),
            },
            retry_limit,
            retry_interval: Duration::from_secs(1),
        }
    }

    fn containers(specs: &[(&str, Vec<ResolvedCheck>)]) -> Vec<ContainerChecks> {
        specs
            .iter()
            .map(|(name, checks)| ContainerChecks {
                name: name.to_string(),
                checks: checks.clone(),
            })
            .collect()
    }

    fn engine(runtime: &FakeRuntime) -> ReadinessEngine {
        ReadinessEngine::new("env-1", Arc::new(runtime.clone()), ReadinessBoard::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_ready() {
        let runtime = FakeRuntime::new();
        let engine = engine(&runtime);

        let outcome = engine
            .wait_all(
                containers(&[("db", vec![net("h:1", 3)]), ("web", vec![]), ("cache", vec![net("h:2", 3)])]),
                WaitMode::UntilReady,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome, ReadinessOutcome::Ready);
        let states = engine.board().snapshot().await;
        assert!(states.values().all(|s| *s == ContainerState::Ready));
        assert_eq!(states.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cancels_siblings() {
        let runtime = FakeRuntime::new();
        runtime.on_dial(|_, address| address != "h:1");
        runtime.on_http(|_| Ok(HttpProbeResponse::new(503, "")));
        let engine = engine(&runtime);

        let slow = ResolvedCheck {
            probe: Probe::Http {
                url: "http://h:2/".to_string(),
                codes: vec![200],
                body: None,
            },
            retry_limit: 100,
            retry_interval: Duration::from_secs(1),
        };

        let outcome = engine
            .wait_all(
                containers(&[("db", vec![net("h:1", 2)]), ("web", vec![slow])]),
                WaitMode::UntilReady,
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            ReadinessOutcome::Failed(failures) => {
                assert_eq!(failures.containers(), vec!["db"]);
                assert_eq!(failures.failures[0].attempts, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(runtime.calls_of("http_get").len() < 100);
        assert_eq!(engine.board().get("db").await, Some(ContainerState::Failed));
        assert_eq!(engine.board().get("web").await, Some(ContainerState::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_exhausted_container_is_reported() {
        let runtime = FakeRuntime::new();
        runtime.on_dial(|_, _| false);
        let engine = engine(&runtime);

        let outcome = engine
            .wait_all(
                containers(&[("db", vec![net("h:1", 2)]), ("web", vec![net("h:2", 2)])]),
                WaitMode::UntilReady,
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            ReadinessOutcome::Failed(failures) => {
                assert_eq!(failures.containers(), vec!["db", "web"])
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancellation() {
        let runtime = FakeRuntime::new();
        runtime.on_dial(|_, _| false);
        let engine = engine(&runtime);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        let outcome = engine
            .wait_all(
                containers(&[("db", vec![net("h:1", 50)])]),
                WaitMode::UntilReady,
                &cancel,
            )
            .await;

        assert_eq!(outcome, ReadinessOutcome::Cancelled);
        assert_eq!(engine.board().get("db").await, Some(ContainerState::Cancelled));
    }
}
