// ABOUTME: Readiness checking for environment containers
// ABOUTME: Single-check retry loops and the concurrent per-environment readiness engine

pub mod engine;
pub mod probe;

pub use engine::{
    ContainerChecks, ContainerState, ReadinessBoard, ReadinessEngine, ReadinessOutcome,
};
pub use probe::{CheckOutcome, Probe, ResolvedCheck, WaitMode};
