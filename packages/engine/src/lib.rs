// ABOUTME: Template-driven engine that builds multi-container test environments
// ABOUTME: Runs sandboxed templates, resolves ports and placeholders, starts and probes containers

pub mod environment;
pub mod error;
pub mod model;
pub mod params;
pub mod readiness;
pub mod request;
pub mod resolve;
pub mod sandbox;

pub use environment::{
    Environment, EnvironmentExport, EnvironmentManager, EnvironmentState, Orchestrator,
};
pub use error::{
    ContainerFailure, EngineError, ModelError, ReadinessFailures, ResolutionError, Result,
    ValidationError,
};
pub use model::{MergedModel, TemplateModel};
pub use params::{ParamSpec, ParamType, TemplateInfo};
pub use readiness::{ContainerState, WaitMode};
pub use request::{EnvironmentOptions, EnvironmentRequest, TemplateRequest};
pub use resolve::{PortAllocation, PortPool, ResolvedEnvironment};
pub use sandbox::{
    DirTemplateLoader, Invocation, MemoryTemplateLoader, TemplateExecutor, TemplateLoader,
};
