// ABOUTME: Docker runtime implementation for envforge environments
// ABOUTME: Uses bollard to pull, build and run containers and tokio/reqwest for readiness probes

use crate::types::tar_entries;
use crate::{
    BuildContext, ContainerRuntime, ContainerSpec, FileMount, HttpProbeResponse, Result,
    RuntimeError, ENV_LABEL, MANAGED_LABEL,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, NetworkingConfig, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
    },
    image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions},
    network::CreateNetworkOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const STOP_TIMEOUT_SECS: i64 = 10;

pub struct DockerRuntime {
    client: Docker,
    http: reqwest::Client,
    /// Cache of successfully pulled images to avoid redundant pulls
    /// Key: image reference, Value: timestamp when pulled
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
    probe_timeout: Duration,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon with default timeouts
    pub fn new() -> Result<Self> {
        Self::with_timeouts(DEFAULT_PULL_TIMEOUT, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timeouts(pull_timeout: Duration, probe_timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?;

        Self::with_client(client, pull_timeout, probe_timeout)
    }

    /// Create with a specific Docker connection
    pub fn with_client(
        client: Docker,
        pull_timeout: Duration,
        probe_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            http,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout,
            probe_timeout,
        })
    }

    /// Convert our spec to bollard config
    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let mut labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.entry(ENV_LABEL.to_string()).or_default();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();

        for (container_port, host_port) in &spec.ports {
            let key = format!("{}/tcp", container_port);
            exposed_ports.insert(key.clone(), HashMap::new());

            let binding = vec![bollard::models::PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }];
            port_bindings.insert(key, Some(binding));
        }

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = bollard::models::HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        // Peers on the environment network resolve the container by hostname
        let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
            endpoints_config: HashMap::from([(
                network.clone(),
                bollard::models::EndpointSettings {
                    aliases: Some(vec![spec.hostname.clone()]),
                    ..Default::default()
                },
            )]),
        });

        Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            entrypoint: spec.entrypoint.as_ref().map(|e| vec![e.clone()]),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::ImageError(e.to_string())),
        }
    }

    async fn upload_files(&self, container_id: &str, spec: &ContainerSpec) -> Result<()> {
        if spec.files.is_empty() {
            return Ok(());
        }

        let archive = tar_entries(
            spec.files
                .iter()
                .map(|f| (f.path.as_str(), f.content.as_slice(), upload_mode(f))),
        )
        .map_err(|e| RuntimeError::InternalError(e.to_string()))?;

        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(container_id, Some(options), archive.into())
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))
    }
}

/// Permission bits of an uploaded mount file
fn upload_mode(file: &FileMount) -> u32 {
    if file.readonly {
        file.mode & !0o222
    } else {
        file.mode
    }
}

/// Port numbers of `6379/tcp` style exposed-port keys, sorted
fn parse_exposed_ports<'a>(keys: impl IntoIterator<Item = &'a String>) -> Vec<u16> {
    let mut ports: Vec<u16> = keys
        .into_iter()
        .filter_map(|key| key.split('/').next()?.parse().ok())
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn fetch_image(&self, reference: &str) -> Result<()> {
        {
            let cache = self.image_cache.read().await;
            if cache.contains_key(reference) && self.image_exists(reference).await? {
                debug!("Image {} found in cache, skipping pull", reference);
                return Ok(());
            }
        }

        info!(
            "Pulling image: {} (timeout: {:?})",
            reference, self.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };

        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();

            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = &info.status {
                            if status != &last_status {
                                debug!("Pull status: {}", status);
                                last_status = status.clone();
                            }
                        }
                        if let Some(error) = info.error {
                            return Err(RuntimeError::ImageError(format!(
                                "Failed to pull image {}: {}",
                                reference, error
                            )));
                        }
                    }
                    Err(e) => {
                        return Err(RuntimeError::ImageError(format!(
                            "Failed to pull image {}: {}",
                            reference, e
                        )));
                    }
                }
            }

            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", reference);
                let mut cache = self.image_cache.write().await;
                cache.insert(reference.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                reference, self.pull_timeout
            ))),
        }
    }

    async fn build_image(&self, context: &BuildContext) -> Result<String> {
        info!(
            "Building image {} from {} context files",
            context.tag,
            context.files.len()
        );

        let archive = tar_entries(
            context
                .files
                .iter()
                .map(|f| (f.path.as_str(), f.content.as_slice(), f.mode)),
        )
        .map_err(|e| RuntimeError::BuildError(e.to_string()))?;

        let options = BuildImageOptions::<String> {
            t: context.tag.clone(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self
            .client
            .build_image(options, None, Some(archive.into()));

        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| {
                RuntimeError::BuildError(format!("Failed to build {}: {}", context.tag, e))
            })?;

            if let Some(error) = info.error {
                return Err(RuntimeError::BuildError(format!(
                    "Failed to build {}: {}",
                    context.tag, error
                )));
            }

            if let Some(line) = info.stream {
                let line = line.trim();
                if !line.is_empty() {
                    debug!("[build {}] {}", context.tag, line);
                }
            }
        }

        Ok(context.tag.clone())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        info!("Removing image: {}", tag);

        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        self.client
            .remove_image(tag, Some(options), None)
            .await
            .map_err(|e| RuntimeError::ImageError(e.to_string()))?;

        Ok(())
    }

    async fn image_ports(&self, reference: &str) -> Result<Vec<u16>> {
        let inspect = self
            .client
            .inspect_image(reference)
            .await
            .map_err(|e| RuntimeError::ImageError(e.to_string()))?;

        let ports = inspect
            .config
            .and_then(|config| config.exposed_ports)
            .map(|exposed| parse_exposed_ports(exposed.keys()))
            .unwrap_or_default();

        debug!("Image {} exposes ports {:?}", reference, ports);
        Ok(ports)
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        info!("Creating network: {}", name);

        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            labels: HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
            ..Default::default()
        };

        let response = self
            .client
            .create_network(options)
            .await
            .map_err(|e| RuntimeError::NetworkError(e.to_string()))?;

        Ok(response.id)
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        info!("Removing network: {}", network_id);

        self.client
            .remove_network(network_id)
            .await
            .map_err(|e| RuntimeError::NetworkError(e.to_string()))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container: {}", spec.name);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))?;

        debug!("Created container: {}", container.id);

        if let Err(e) = self.upload_files(&container.id, spec).await {
            warn!(
                "Failed to upload files into {}, removing it: {}",
                spec.name, e
            );
            if let Err(remove_err) = self.remove_container(&container.id).await {
                warn!("Failed to remove container {}: {}", container.id, remove_err);
            }
            return Err(e);
        }

        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!("Starting container: {}", container_id);

        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        info!("Stopping container: {}", container_id);

        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };

        self.client
            .stop_container(container_id, Some(options))
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        info!("Removing container: {}", container_id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.client
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))
    }

    async fn dial(&self, protocol: &str, address: &str) -> Result<bool> {
        match protocol {
            "tcp" => {
                match tokio::time::timeout(self.probe_timeout, TcpStream::connect(address)).await
                {
                    Ok(Ok(_)) => Ok(true),
                    Ok(Err(e)) => {
                        debug!("Dial tcp {} failed: {}", address, e);
                        Ok(false)
                    }
                    Err(_) => {
                        debug!("Dial tcp {} timed out", address);
                        Ok(false)
                    }
                }
            }
            "udp" => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .map_err(|e| RuntimeError::ProbeError(e.to_string()))?;
                Ok(socket.connect(address).await.is_ok())
            }
            other => Err(RuntimeError::NotSupported(format!(
                "Unsupported dial protocol: {}",
                other
            ))),
        }
    }

    async fn http_get(&self, url: &str) -> Result<HttpProbeResponse> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| RuntimeError::ProbeError(format!("GET {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(HttpProbeResponse { status, body })
    }
}
