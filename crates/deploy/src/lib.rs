//! Keel deploy: ordered reconcile, readiness gates and verification for one
//! application, reported as a single serializable run record.

#![forbid(unsafe_code)]

mod orchestrator;
mod report;
mod state;

pub use orchestrator::{DeployOptions, Orchestrator, VerificationSpec, VerifyTarget};
pub use report::{DeployReport, Failure, GateKind, GateRecord, StepRecord, VerificationOutcome};
pub use state::RunState;
