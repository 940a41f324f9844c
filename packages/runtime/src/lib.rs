// ABOUTME: Container runtime trait and implementations for envforge environments
// ABOUTME: Defines the narrow verb set the engine uses to fetch, build, run and probe containers

use async_trait::async_trait;

pub mod docker;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod types;

pub use docker::DockerRuntime;
pub use error::{Result, RuntimeError};
#[cfg(any(test, feature = "test-utils"))]
pub use fake::{FakeRuntime, RuntimeCall};
pub use types::{BuildContext, BuildFile, ContainerSpec, FileMount, HttpProbeResponse};

/// Label marking containers created by envforge
pub const MANAGED_LABEL: &str = "envforge.managed";
/// Label carrying the owning environment id
pub const ENV_LABEL: &str = "envforge.env";

/// Runtime collaborator used by the environment orchestrator.
///
/// These verbs are the only points where the engine touches the outside
/// container runtime or the network.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make a pre-built image available locally
    async fn fetch_image(&self, reference: &str) -> Result<()>;

    /// Build an image from an in-memory context, returning the image id
    async fn build_image(&self, context: &BuildContext) -> Result<String>;

    /// Remove a previously built image
    async fn remove_image(&self, tag: &str) -> Result<()>;

    /// Ports an image declares as exposed
    async fn image_ports(&self, reference: &str) -> Result<Vec<u16>>;

    /// Create a bridge network whose members resolve each other by hostname
    async fn create_network(&self, name: &str) -> Result<String>;

    async fn remove_network(&self, network_id: &str) -> Result<()>;

    /// Create (but do not start) a container, including its file mounts
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    async fn stop_container(&self, container_id: &str) -> Result<()>;

    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Attempt a connection; `Ok(false)` means the peer did not answer
    async fn dial(&self, protocol: &str, address: &str) -> Result<bool>;

    /// Issue a GET request and report the status code and body
    async fn http_get(&self, url: &str) -> Result<HttpProbeResponse>;
}
