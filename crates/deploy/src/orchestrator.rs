use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_apply::{Reconciler, RetryPolicy};
use keel_core::{Deadline, DeploymentPlan, KeelError, ResourceKind, ResourceRef, Stage};
use keel_kubehub::ControlPlane;
use keel_ops::{watch_endpoints, watch_workload};
use keel_probe::{endpoint_from_exposure, Endpoint, ProbePolicy, ProbeRequest, Verifier};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::report::{DeployReport, Failure, GateKind, GateRecord, StepRecord, VerificationOutcome};
use crate::state::StateMachine;
use crate::RunState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeployOptions {
    pub retry: RetryPolicy,
    /// Cadence of readiness polls.
    pub poll_interval: Duration,
    pub probe: ProbePolicy,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self { retry: RetryPolicy::default(), poll_interval: Duration::from_secs(2), probe: ProbePolicy::default() }
    }
}

/// Where the verification call goes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerifyTarget {
    /// Host of the reconciled Ingress or Route.
    FromExposure,
    Url(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSpec {
    pub request: ProbeRequest,
    pub target: VerifyTarget,
    #[serde(default)]
    pub insecure_tls: bool,
}

impl VerificationSpec {
    pub fn from_exposure(request: ProbeRequest) -> Self {
        Self { request, target: VerifyTarget::FromExposure, insecure_tls: false }
    }

    pub fn url(url: &str, request: ProbeRequest) -> Self {
        Self { request, target: VerifyTarget::Url(url.to_string()), insecure_tls: false }
    }

    pub fn insecure(mut self, on: bool) -> Self {
        self.insecure_tls = on;
        self
    }
}

/// Runs one plan end to end: reconcile in order, gate on readiness, verify.
#[derive(Clone)]
pub struct Orchestrator {
    cp: Arc<dyn ControlPlane>,
    reconciler: Reconciler,
    verifier: Verifier,
    opts: DeployOptions,
}

struct Run {
    report: DeployReport,
    machine: StateMachine,
    t0: Instant,
}

impl Run {
    fn advance(&mut self, to: RunState) -> Result<(), KeelError> {
        self.machine.advance(to)?;
        self.report.state = to;
        Ok(())
    }

    fn fail(mut self, stage: Stage, reference: Option<ResourceRef>, error: KeelError, last_observed: Option<String>) -> DeployReport {
        let phase = self.machine.state();
        if let Err(e) = self.machine.advance(RunState::Failed) {
            warn!(error = %e, "run already terminal");
        }
        warn!(run_id = %self.report.run_id, stage = %stage, phase = %phase, error = %error, "deploy failed");
        self.report.state = RunState::Failed;
        self.report.failed_in = Some(stage);
        self.report.failure = Some(Failure { stage, phase, reference, error, last_observed });
        self.finish()
    }

    fn finish(mut self) -> DeployReport {
        self.report.elapsed_ms = self.t0.elapsed().as_millis() as u64;
        histogram!("deploy_latency_ms", self.report.elapsed_ms as f64);
        match self.report.state {
            RunState::Complete => counter!("deploy_complete", 1u64),
            _ => counter!("deploy_failed", 1u64),
        }
        self.report
    }
}

impl Orchestrator {
    pub fn new(cp: Arc<dyn ControlPlane>, opts: DeployOptions) -> Self {
        let reconciler = Reconciler::new(cp.clone()).with_policy(opts.retry);
        Self { cp, reconciler, verifier: Verifier::new(opts.probe), opts }
    }

    pub fn options(&self) -> &DeployOptions { &self.opts }

    /// Execute `plan` under one shared `deadline`.
    ///
    /// The first terminal error stops the run; the report lists exactly the
    /// steps that completed before it.
    pub async fn deploy(&self, plan: &DeploymentPlan, verification: Option<&VerificationSpec>, deadline: &Deadline) -> DeployReport {
        counter!("deploy_runs", 1u64);
        let mut run = Run { report: DeployReport::new(Uuid::new_v4()), machine: StateMachine::new(), t0: Instant::now() };
        let run_id = run.report.run_id;
        info!(%run_id, resources = plan.len(), "deploy started");

        if let Err(e) = run.advance(RunState::ReconcilingResources) {
            return run.fail(Stage::Namespace, None, e, None);
        }
        let mut exposure: Option<Json> = None;
        for desc in plan {
            let stage = desc.kind().stage();
            let t = Instant::now();
            match self.reconciler.reconcile_traced(desc, deadline).await {
                Ok(done) => {
                    info!(%run_id, stage = %stage, target_ref = %done.reference, action = done.action.as_str(), "step complete");
                    if desc.kind().is_exposure() && exposure.is_none() {
                        exposure = Some(done.state.clone());
                    }
                    run.report.steps.push(StepRecord {
                        reference: done.reference,
                        stage,
                        action: done.action,
                        summary: done.summary,
                        elapsed_ms: t.elapsed().as_millis() as u64,
                    });
                    run.report.last_completed = Some(stage);
                }
                Err(f) => return run.fail(stage, Some(desc.reference.clone()), f.error, f.last_observed),
            }
        }

        if let Err(e) = run.advance(RunState::WaitingReady) {
            return run.fail(Stage::Readiness, None, e, None);
        }
        for desc in plan.of_kind(ResourceKind::Workload) {
            let t = Instant::now();
            match watch_workload(self.cp.as_ref(), &desc.reference, self.opts.poll_interval, deadline).await {
                Ok(ok) => {
                    info!(%run_id, target_ref = %desc.reference, observed = %ok.state, "workload ready");
                    run.report.gates.push(GateRecord {
                        reference: desc.reference.clone(),
                        gate: GateKind::Workload,
                        passed: true,
                        observed: Some(ok.state.to_string()),
                        polls: ok.polls,
                        elapsed_ms: t.elapsed().as_millis() as u64,
                    });
                }
                Err(f) => {
                    let observed = f.last.as_ref().map(|s| s.to_string());
                    run.report.gates.push(GateRecord {
                        reference: desc.reference.clone(),
                        gate: GateKind::Workload,
                        passed: false,
                        observed: observed.clone(),
                        polls: f.polls,
                        elapsed_ms: t.elapsed().as_millis() as u64,
                    });
                    return run.fail(Stage::Readiness, Some(desc.reference.clone()), f.error, observed);
                }
            }
        }
        for desc in plan.of_kind(ResourceKind::Service) {
            let t = Instant::now();
            match watch_endpoints(self.cp.as_ref(), &desc.reference, self.opts.poll_interval, deadline).await {
                Ok(ok) => {
                    info!(%run_id, target_ref = %desc.reference, observed = %ok.state, "endpoints ready");
                    run.report.gates.push(GateRecord {
                        reference: desc.reference.clone(),
                        gate: GateKind::Endpoints,
                        passed: true,
                        observed: Some(ok.state.to_string()),
                        polls: ok.polls,
                        elapsed_ms: t.elapsed().as_millis() as u64,
                    });
                }
                Err(f) => {
                    let observed = f.last.as_ref().map(|s| s.to_string());
                    run.report.gates.push(GateRecord {
                        reference: desc.reference.clone(),
                        gate: GateKind::Endpoints,
                        passed: false,
                        observed: observed.clone(),
                        polls: f.polls,
                        elapsed_ms: t.elapsed().as_millis() as u64,
                    });
                    return run.fail(Stage::Readiness, Some(desc.reference.clone()), f.error, observed);
                }
            }
        }
        run.report.last_completed = Some(Stage::Readiness);

        if let Err(e) = run.advance(RunState::Verifying) {
            return run.fail(Stage::Verification, None, e, None);
        }
        match verification {
            None => {
                info!(%run_id, "verification skipped");
                run.report.verification = VerificationOutcome::Skipped;
            }
            Some(spec) => {
                let endpoint = match resolve_endpoint(spec, exposure.as_ref()) {
                    Ok(ep) => ep,
                    Err(e) => return run.fail(Stage::Verification, None, e, None),
                };
                let res = self.verifier.verify(&endpoint, &spec.request, deadline).await;
                run.report.verification = VerificationOutcome::Ran(res.clone());
                if !res.success {
                    let err = match res.error_kind {
                        Some(keel_probe::ProbeErrorKind::Timeout) if deadline.is_exceeded() => deadline.timeout_error("verification"),
                        _ => KeelError::Verification(res.describe()),
                    };
                    return run.fail(Stage::Verification, None, err, None);
                }
                run.report.last_completed = Some(Stage::Verification);
            }
        }

        if let Err(e) = run.advance(RunState::Complete) {
            return run.fail(Stage::Verification, None, e, None);
        }
        info!(%run_id, elapsed_ms = run.t0.elapsed().as_millis() as u64, "deploy complete");
        run.finish()
    }
}

fn resolve_endpoint(spec: &VerificationSpec, exposure: Option<&Json>) -> Result<Endpoint, KeelError> {
    let ep = match &spec.target {
        VerifyTarget::Url(u) => Endpoint::new(u),
        VerifyTarget::FromExposure => {
            let state = exposure.ok_or_else(|| KeelError::Validation("no Ingress or Route in plan to derive the verification endpoint from".into()))?;
            endpoint_from_exposure(state)?
        }
    };
    Ok(ep.insecure(spec.insecure_tls))
}
