use keel_core::{KeelError, KeelResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one deploy run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    ReconcilingResources,
    WaitingReady,
    Verifying,
    Complete,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool { matches!(self, RunState::Complete | RunState::Failed) }

    pub fn can_transition(self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (Complete | Failed, _) => false,
            (_, Failed) => true,
            (Pending, ReconcilingResources)
            | (ReconcilingResources, WaitingReady)
            | (WaitingReady, Verifying)
            | (Verifying, Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "Pending",
            RunState::ReconcilingResources => "ReconcilingResources",
            RunState::WaitingReady => "WaitingReady",
            RunState::Verifying => "Verifying",
            RunState::Complete => "Complete",
            RunState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Guarded holder for the current run state.
#[derive(Debug)]
pub(crate) struct StateMachine {
    state: RunState,
}

impl StateMachine {
    pub(crate) fn new() -> Self { Self { state: RunState::Pending } }

    pub(crate) fn state(&self) -> RunState { self.state }

    pub(crate) fn advance(&mut self, to: RunState) -> KeelResult<()> {
        if !self.state.can_transition(to) {
            return Err(KeelError::Internal(format!("illegal run transition {} -> {}", self.state, to)));
        }
        self.state = to;
        Ok(())
    }
}
