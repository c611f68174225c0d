use chrono::{DateTime, Utc};
use keel_apply::{DiffSummary, ReconcileAction};
use keel_core::{KeelError, KeelResult, ResourceRef, Stage};
use keel_probe::VerificationResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::RunState;

/// One reconcile step that returned success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub reference: ResourceRef,
    pub stage: Stage,
    pub action: ReconcileAction,
    pub summary: DiffSummary,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Workload,
    Endpoints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRecord {
    pub reference: ResourceRef,
    pub gate: GateKind,
    pub passed: bool,
    /// Last observed state, e.g. "0 of 1 replicas ready".
    pub observed: Option<String>,
    pub polls: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    /// Not reached.
    NotRun,
    /// No verification was requested.
    Skipped,
    Ran(VerificationResult),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub stage: Stage,
    /// Run state the failure happened in.
    pub phase: RunState,
    pub reference: Option<ResourceRef>,
    pub error: KeelError,
    pub last_observed: Option<String>,
}

/// Everything a caller needs to know about one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployReport {
    pub run_id: Uuid,
    pub state: RunState,
    pub failed_in: Option<Stage>,
    pub steps: Vec<StepRecord>,
    pub gates: Vec<GateRecord>,
    pub verification: VerificationOutcome,
    pub failure: Option<Failure>,
    /// Last stage that finished successfully.
    pub last_completed: Option<Stage>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl DeployReport {
    pub(crate) fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Pending,
            failed_in: None,
            steps: Vec::new(),
            gates: Vec::new(),
            verification: VerificationOutcome::NotRun,
            failure: None,
            last_completed: None,
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }

    pub fn is_complete(&self) -> bool { self.state == RunState::Complete }

    /// Whether re-running the whole deploy could plausibly succeed.
    pub fn retryable(&self) -> bool {
        self.failure.as_ref().map(|f| f.error.is_retryable()).unwrap_or(false)
    }

    pub fn into_result(self) -> KeelResult<DeployReport> {
        match &self.failure {
            Some(f) => Err(f.error.clone()),
            None => Ok(self),
        }
    }

    /// Single human-readable line.
    pub fn summary(&self) -> String {
        let last = self.last_completed.map(|s| s.to_string()).unwrap_or_else(|| "nothing".into());
        match &self.failure {
            None => format!(
                "{} in {} ms: {} resources reconciled, {} gates passed, last completed {}",
                self.state, self.elapsed_ms, self.steps.len(), self.gates.iter().filter(|g| g.passed).count(), last
            ),
            Some(f) => {
                let mut s = format!("{} at {}", self.state, f.stage);
                if let Some(r) = &f.reference {
                    s.push_str(&format!(" ({})", r));
                }
                s.push_str(&format!(": {}", f.error));
                if let Some(obs) = &f.last_observed {
                    s.push_str(&format!(" [last observed: {}]", obs));
                }
                s.push_str(&format!("; last completed {}", last));
                if self.retryable() { s.push_str("; retryable"); }
                s
            }
        }
    }
}
