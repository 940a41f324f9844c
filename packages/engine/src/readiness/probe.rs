// ABOUTME: Resolved readiness checks and the retry loop that runs one of them
// ABOUTME: Net dials and HTTP GETs through the container runtime with cooperative cancellation

use envforge_runtime::ContainerRuntime;
use regex::Regex;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What one attempt does, with every placeholder already substituted
#[derive(Debug, Clone)]
pub enum Probe {
    Net {
        protocol: String,
        address: String,
    },
    Http {
        url: String,
        /// Empty accepts any status
        codes: Vec<u16>,
        body: Option<Regex>,
    },
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Net { protocol, address } => write!(f, "net {} {}", protocol, address),
            Probe::Http { url, .. } => write!(f, "http {}", url),
        }
    }
}

impl Probe {
    /// Run one attempt. `Err` carries the reason the target was not ready.
    pub async fn attempt(&self, runtime: &dyn ContainerRuntime) -> Result<(), String> {
        match self {
            Probe::Net { protocol, address } => match runtime.dial(protocol, address).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(format!("no answer from {}", address)),
                Err(e) => Err(e.to_string()),
            },
            Probe::Http { url, codes, body } => {
                let response = runtime.http_get(url).await.map_err(|e| e.to_string())?;

                if !codes.is_empty() && !codes.contains(&response.status) {
                    return Err(format!("unexpected status {}", response.status));
                }
                if let Some(pattern) = body {
                    if !pattern.is_match(&response.body) {
                        return Err(format!("body does not match /{}/", pattern.as_str()));
                    }
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedCheck {
    pub probe: Probe,
    pub retry_limit: u32,
    pub retry_interval: Duration,
}

/// Whether a check waits for its target to come up or to go away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    UntilReady,
    UntilDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed { attempts: u32 },
    Exhausted { attempts: u32, last_error: Option<String> },
    Cancelled { attempts: u32 },
}

impl ResolvedCheck {
    /// Attempt the probe exactly `retry_limit` times at most.
    ///
    /// Cancellation is observed between attempts; an attempt in flight
    /// always completes.
    pub async fn run(
        &self,
        runtime: &dyn ContainerRuntime,
        mode: WaitMode,
        cancel: &CancellationToken,
    ) -> CheckOutcome {
        let limit = self.retry_limit.max(1);
        let mut last_error = None;

        for attempt in 1..=limit {
            if cancel.is_cancelled() {
                return CheckOutcome::Cancelled {
                    attempts: attempt - 1,
                };
            }

            let result = self.probe.attempt(runtime).await;
            let passed = match (mode, &result) {
                (WaitMode::UntilReady, Ok(())) => true,
                (WaitMode::UntilReady, Err(e)) => {
                    last_error = Some(e.clone());
                    false
                }
                (WaitMode::UntilDown, Ok(())) => {
                    last_error = Some("target still answering".to_string());
                    false
                }
                (WaitMode::UntilDown, Err(_)) => true,
            };

            if passed {
                return CheckOutcome::Passed { attempts: attempt };
            }

            debug!(
                "Check {} attempt {}/{} not satisfied: {}",
                self.probe,
                attempt,
                limit,
                last_error.as_deref().unwrap_or("")
            );

            if attempt < limit {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return CheckOutcome::Cancelled { attempts: attempt };
                    }
                    _ = tokio::time::sleep(self.retry_interval) => {}
                }
            }
        }

        CheckOutcome::Exhausted {
            attempts: limit,
            last_error,
        }
    }
}
