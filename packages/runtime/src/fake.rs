// ABOUTME: In-memory runtime that records every verb for tests
// ABOUTME: Supports injected failures, artificial delays and scripted probe answers

use crate::{
    BuildContext, ContainerRuntime, ContainerSpec, HttpProbeResponse, Result, RuntimeError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type DialResponder = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;
type HttpResponder = Arc<dyn Fn(&str) -> Result<HttpProbeResponse> + Send + Sync>;

/// One recorded runtime interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    FetchImage(String),
    BuildImage(String),
    RemoveImage(String),
    ImagePorts(String),
    CreateNetwork(String),
    RemoveNetwork(String),
    CreateContainer(String),
    StartContainer(String),
    StopContainer(String),
    RemoveContainer(String),
    Dial { protocol: String, address: String },
    HttpGet(String),
}

impl RuntimeCall {
    fn verb(&self) -> &'static str {
        match self {
            RuntimeCall::FetchImage(_) => "fetch_image",
            RuntimeCall::BuildImage(_) => "build_image",
            RuntimeCall::RemoveImage(_) => "remove_image",
            RuntimeCall::ImagePorts(_) => "image_ports",
            RuntimeCall::CreateNetwork(_) => "create_network",
            RuntimeCall::RemoveNetwork(_) => "remove_network",
            RuntimeCall::CreateContainer(_) => "create_container",
            RuntimeCall::StartContainer(_) => "start_container",
            RuntimeCall::StopContainer(_) => "stop_container",
            RuntimeCall::RemoveContainer(_) => "remove_container",
            RuntimeCall::Dial { .. } => "dial",
            RuntimeCall::HttpGet(_) => "http_get",
        }
    }

    /// Image, container, network, address or URL the call acted on
    pub fn target(&self) -> &str {
        match self {
            RuntimeCall::FetchImage(t)
            | RuntimeCall::BuildImage(t)
            | RuntimeCall::RemoveImage(t)
            | RuntimeCall::ImagePorts(t)
            | RuntimeCall::CreateNetwork(t)
            | RuntimeCall::RemoveNetwork(t)
            | RuntimeCall::CreateContainer(t)
            | RuntimeCall::StartContainer(t)
            | RuntimeCall::StopContainer(t)
            | RuntimeCall::RemoveContainer(t)
            | RuntimeCall::HttpGet(t) => t,
            RuntimeCall::Dial { address, .. } => address,
        }
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<RuntimeCall>,
    failures: Vec<(&'static str, String)>,
    delays: HashMap<&'static str, Duration>,
    created: Vec<ContainerSpec>,
    built: Vec<BuildContext>,
    image_ports: HashMap<String, Vec<u16>>,
}

/// Container runtime double.
///
/// Container and network ids are their names, so recorded calls read
/// naturally. By default every verb succeeds, images expose no ports, every
/// dial answers and every GET returns `200 ""`.
#[derive(Clone)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
    dial: Arc<Mutex<DialResponder>>,
    http: Arc<Mutex<HttpResponder>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            dial: Arc::new(Mutex::new(Arc::new(|_, _| true))),
            http: Arc::new(Mutex::new(Arc::new(|_| Ok(HttpProbeResponse::new(200, ""))))),
        }
    }

    /// Make `verb` fail for `target`; `"*"` matches every target
    pub fn fail_on(&self, verb: &'static str, target: impl Into<String>) -> &Self {
        self.lock().failures.push((verb, target.into()));
        self
    }

    /// Ports reported by `image_ports` for `reference`
    pub fn expose_image_ports(&self, reference: impl Into<String>, ports: &[u16]) -> &Self {
        self.lock().image_ports.insert(reference.into(), ports.to_vec());
        self
    }

    /// Sleep before completing every call of `verb`
    pub fn delay(&self, verb: &'static str, duration: Duration) -> &Self {
        self.lock().delays.insert(verb, duration);
        self
    }

    pub fn on_dial<F>(&self, responder: F) -> &Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut dial) = self.dial.lock() {
            *dial = Arc::new(responder);
        }
        self
    }

    pub fn on_http<F>(&self, responder: F) -> &Self
    where
        F: Fn(&str) -> Result<HttpProbeResponse> + Send + Sync + 'static,
    {
        if let Ok(mut http) = self.http.lock() {
            *http = Arc::new(responder);
        }
        self
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    /// Recorded calls of one verb, in order
    pub fn calls_of(&self, verb: &str) -> Vec<RuntimeCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.verb() == verb)
            .cloned()
            .collect()
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    pub fn built_contexts(&self) -> Vec<BuildContext> {
        self.lock().built.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn record(&self, call: RuntimeCall) -> Result<()> {
        let (delay, failing) = {
            let mut state = self.lock();
            let failing = state
                .failures
                .iter()
                .any(|(verb, target)| *verb == call.verb() && (target == "*" || target == call.target()));
            let delay = state.delays.get(call.verb()).copied();
            state.calls.push(call.clone());
            (delay, failing)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if failing {
            return Err(RuntimeError::InternalError(format!(
                "injected {} failure for {}",
                call.verb(),
                call.target()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn fetch_image(&self, reference: &str) -> Result<()> {
        self.record(RuntimeCall::FetchImage(reference.to_string()))
            .await
    }

    async fn build_image(&self, context: &BuildContext) -> Result<String> {
        self.record(RuntimeCall::BuildImage(context.tag.clone()))
            .await?;
        self.lock().built.push(context.clone());
        Ok(context.tag.clone())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        self.record(RuntimeCall::RemoveImage(tag.to_string())).await
    }

    async fn image_ports(&self, reference: &str) -> Result<Vec<u16>> {
        self.record(RuntimeCall::ImagePorts(reference.to_string()))
            .await?;
        Ok(self
            .lock()
            .image_ports
            .get(reference)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        self.record(RuntimeCall::CreateNetwork(name.to_string()))
            .await?;
        Ok(name.to_string())
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        self.record(RuntimeCall::RemoveNetwork(network_id.to_string()))
            .await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(RuntimeCall::CreateContainer(spec.name.clone()))
            .await?;
        self.lock().created.push(spec.clone());
        Ok(spec.name.clone())
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.record(RuntimeCall::StartContainer(container_id.to_string()))
            .await
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.record(RuntimeCall::StopContainer(container_id.to_string()))
            .await
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.record(RuntimeCall::RemoveContainer(container_id.to_string()))
            .await
    }

    async fn dial(&self, protocol: &str, address: &str) -> Result<bool> {
        self.record(RuntimeCall::Dial {
            protocol: protocol.to_string(),
            address: address.to_string(),
        })
        .await?;

        let responder = match self.dial.lock() {
            Ok(dial) => dial.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Ok(responder(protocol, address))
    }

    async fn http_get(&self, url: &str) -> Result<HttpProbeResponse> {
        self.record(RuntimeCall::HttpGet(url.to_string())).await?;

        let responder = match self.http.lock() {
            Ok(http) => http.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        responder(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_in_order() {
        let runtime = FakeRuntime::new();
        runtime.fetch_image("redis:7").await.unwrap();
        runtime
            .create_container(&ContainerSpec {
                name: "env-cache".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        runtime.start_container("env-cache").await.unwrap();

        assert_eq!(
            runtime.calls(),
            vec![
                RuntimeCall::FetchImage("redis:7".to_string()),
                RuntimeCall::CreateContainer("env-cache".to_string()),
                RuntimeCall::StartContainer("env-cache".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_injected_failure_only_hits_target() {
        let runtime = FakeRuntime::new();
        runtime.fail_on("start_container", "env-db");

        assert!(runtime.start_container("env-web").await.is_ok());
        assert!(runtime.start_container("env-db").await.is_err());
    }

    #[tokio::test]
    async fn test_image_ports_default_to_none() {
        let runtime = FakeRuntime::new();
        runtime.expose_image_ports("redis:7", &[6379]);

        assert_eq!(runtime.image_ports("redis:7").await.unwrap(), vec![6379]);
        assert!(runtime.image_ports("alpine:3").await.unwrap().is_empty());
        assert_eq!(
            runtime.calls_of("image_ports")[1].target(),
            "alpine:3"
        );
    }

    #[tokio::test]
    async fn test_dial_responder() {
        let runtime = FakeRuntime::new();
        runtime.on_dial(|_, address| address.ends_with(":80"));

        assert!(runtime.dial("tcp", "localhost:80").await.unwrap());
        assert!(!runtime.dial("tcp", "localhost:81").await.unwrap());
        assert_eq!(runtime.calls_of("dial").len(), 2);
    }
}
