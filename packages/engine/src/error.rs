// ABOUTME: Error taxonomy for template execution, model building, resolution and readiness
// ABOUTME: Each stage has its own structured error type carried by EngineError

use envforge_config::ConfigError;
use envforge_runtime::RuntimeError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Bad or missing template parameter, raised before any model mutation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Template {template}: missing mandatory parameter '{parameter}'")]
    Missing { template: String, parameter: String },

    #[error("Template {template}: parameter '{parameter}' must be {expected}, got {actual}")]
    WrongType {
        template: String,
        parameter: String,
        expected: &'static str,
        actual: String,
    },

    #[error("Template {template}: parameter '{parameter}' declares unknown type '{tag}'")]
    UnknownType {
        template: String,
        parameter: String,
        tag: String,
    },

    #[error("Template {template}: parameter '{parameter}' is not valid base64: {reason}")]
    InvalidBase64 {
        template: String,
        parameter: String,
        reason: String,
    },
}

/// Structural conflict in the declarative model
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Duplicate container name '{name}' (declared by {first} and {second})")]
    DuplicateContainer {
        name: String,
        first: String,
        second: String,
    },

    #[error("Template {template}: container '{container}' declares port {port} twice")]
    DuplicatePort {
        template: String,
        container: String,
        port: u16,
    },

    #[error("Template {template}: port {port} of container '{container}' is out of range")]
    InvalidPort {
        template: String,
        container: String,
        port: i64,
    },

    #[error("Template {template}: workspace of image '{image}' already contains '{file}'")]
    DuplicateWorkspaceFile {
        template: String,
        image: String,
        file: String,
    },

    #[error("Template {template}: workspace of image '{image}' has no file '{file}'")]
    UnknownWorkspaceFile {
        template: String,
        image: String,
        file: String,
    },

    #[error("Template {template}: data path '{path}' not found")]
    MissingData { template: String, path: String },

    #[error("Template {template}: invalid path '{path}'")]
    InvalidPath { template: String, path: String },
}

/// Placeholder or port allocation failure, raised before any container starts
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("Port range {min}-{max} cannot supply {requested} more ports")]
    PortsExhausted { requested: usize, min: u16, max: u16 },

    #[error("Container '{container}': unknown placeholder '{token}'")]
    UnknownPlaceholder { container: String, token: String },

    #[error("Container '{container}': malformed placeholder in '{input}': {reason}")]
    Malformed {
        container: String,
        input: String,
        reason: String,
    },

    #[error("Container '{container}': port {port} of '{target}' is not exposed")]
    UnknownPort {
        container: String,
        target: String,
        port: u16,
    },

    #[error("Container '{container}': referenced container '{target}' does not exist")]
    UnknownContainer { container: String, target: String },

    #[error("Container '{container}': no container carries label {label}={value}")]
    NoContainerWithLabel {
        container: String,
        label: String,
        value: String,
    },

    #[error("Container '{container}': label '{label}' of '{target}' is not set")]
    UnknownLabel {
        container: String,
        target: String,
        label: String,
    },

    #[error("Workspace file '{file}': no substitution for '{key}'")]
    UnknownSubstitution { file: String, key: String },
}

/// One container whose readiness checks ran out of attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerFailure {
    pub container: String,
    /// Human readable check target, e.g. `http http://localhost:20001/health`
    pub check: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Every container that failed readiness, not only the first
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessFailures {
    pub failures: Vec<ContainerFailure>,
}

impl std::error::Error for ReadinessFailures {}

impl fmt::Display for ReadinessFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Readiness checks failed for ")?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "{} ({} after {} attempts",
                failure.container, failure.check, failure.attempts
            )?;
            if let Some(err) = &failure.last_error {
                write!(f, ": {}", err)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl ReadinessFailures {
    pub fn containers(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.container.as_str()).collect()
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Template {template} failed: {message}")]
    Template { template: String, message: String },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Readiness(#[from] ReadinessFailures),

    #[error("Environment {env_id} was not ready within {timeout:?}")]
    Deadline { env_id: String, timeout: Duration },

    #[error("Environment {0} was cancelled")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Request(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn template(template: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Template {
            template: template.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_failures_lists_every_container() {
        let err = ReadinessFailures {
            failures: vec![
                ContainerFailure {
                    container: "db".to_string(),
                    check: "net tcp localhost:20000".to_string(),
                    attempts: 5,
                    last_error: None,
                },
                ContainerFailure {
                    container: "web".to_string(),
                    check: "http http://localhost:20001/".to_string(),
                    attempts: 3,
                    last_error: Some("status 500".to_string()),
                },
            ],
        };

        assert_eq!(
            err.to_string(),
            "Readiness checks failed for db (net tcp localhost:20000 after 5 attempts), \
             web (http http://localhost:20001/ after 3 attempts: status 500)"
        );
        assert_eq!(err.containers(), vec!["db", "web"]);
    }

    #[test]
    fn test_validation_error_names_parameter() {
        let err: EngineError = ValidationError::Missing {
            template: "db/mongo".to_string(),
            parameter: "init".to_string(),
        }
        .into();

        assert_eq!(
            err.to_string(),
            "Template db/mongo: missing mandatory parameter 'init'"
        );
    }
}
