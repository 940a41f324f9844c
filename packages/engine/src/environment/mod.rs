// ABOUTME: Environment lifecycle: state machine, construction and the manager registry
// ABOUTME: Ties templates, ports, the runtime and readiness checks together per environment

#[allow(clippy::module_inception)]
pub mod environment;
pub mod manager;
pub mod orchestrator;
pub mod state;

pub use environment::{
    environment_id, Environment, EnvironmentExport, ExportedContainer, ExportedInstance,
};
pub use manager::EnvironmentManager;
pub use orchestrator::Orchestrator;
pub use state::EnvironmentState;
