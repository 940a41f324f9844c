// ABOUTME: Error types for container runtime operations
// ABOUTME: Separates connection, image, build, container, network and probe failures

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Build error: {0}")]
    BuildError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Probe error: {0}")]
    ProbeError(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
