// ABOUTME: Environment lifecycle states and the transitions allowed between them
// ABOUTME: States only move forward; a terminated environment never comes back

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Pending,
    Ready,
    Failed,
    TearingDown,
    Terminated,
}

impl EnvironmentState {
    pub fn can_transition_to(self, next: EnvironmentState) -> bool {
        use EnvironmentState::*;

        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Failed)
                | (Pending, TearingDown)
                | (Ready, TearingDown)
                | (Failed, TearingDown)
                | (TearingDown, Terminated)
        )
    }

    /// Whether the environment is being or has been torn down
    pub fn is_closing(self) -> bool {
        matches!(self, EnvironmentState::TearingDown | EnvironmentState::Terminated)
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvironmentState::Pending => "pending",
            EnvironmentState::Ready => "ready",
            EnvironmentState::Failed => "failed",
            EnvironmentState::TearingDown => "tearing_down",
            EnvironmentState::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}
