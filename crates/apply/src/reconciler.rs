use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::{Deadline, KeelError, KeelResult, ResourceDescriptor, ResourceRef};
use keel_kubehub::ControlPlane;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use crate::merge::{converged, diff_summary, fold_string_data, merge_onto_live, strip_noisy, DiffSummary};

/// Backoff applied while the control plane is unavailable. Waits double
/// from `initial_backoff` up to `max_backoff` and never outlive the deadline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Fresh re-fetch + merge attempts after a write conflict.
    pub conflict_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { initial_backoff: Duration::from_millis(250), max_backoff: Duration::from_secs(5), conflict_retries: 1 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Created,
    Updated,
    Unchanged,
}

impl ReconcileAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileAction::Created => "created",
            ReconcileAction::Updated => "updated",
            ReconcileAction::Unchanged => "unchanged",
        }
    }
}

/// Outcome of one successful reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciled {
    pub reference: ResourceRef,
    pub action: ReconcileAction,
    /// Live object as the control plane holds it after the call.
    pub state: Json,
    pub summary: DiffSummary,
}

/// A failed reconcile together with what was last seen of the object.
#[derive(Debug, Clone)]
pub struct ReconcileFailure {
    pub error: KeelError,
    /// Last live `resourceVersion` fetched and the last transient error, if any.
    pub last_observed: Option<String>,
}

#[derive(Default)]
struct Trace {
    live: Option<String>,
    last_error: Option<String>,
}

impl Trace {
    fn saw(&mut self, live: Option<&Json>) {
        self.live = Some(match live {
            Some(obj) => match obj.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()) {
                Some(rv) => format!("live resourceVersion {}", rv),
                None => "live object without resourceVersion".to_string(),
            },
            None => "object absent".to_string(),
        });
    }

    fn summary(self) -> Option<String> {
        match (self.live, self.last_error) {
            (Some(l), Some(e)) => Some(format!("{}; last error: {}", l, e)),
            (Some(l), None) => Some(l),
            (None, Some(e)) => Some(format!("last error: {}", e)),
            (None, None) => None,
        }
    }
}

/// Drives one object at a time toward its desired state.
#[derive(Clone)]
pub struct Reconciler {
    cp: Arc<dyn ControlPlane>,
    policy: RetryPolicy,
}

impl Reconciler {
    pub fn new(cp: Arc<dyn ControlPlane>) -> Self { Self { cp, policy: RetryPolicy::default() } }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy { &self.policy }

    /// Create the object if absent, otherwise merge desired onto live and
    /// replace it. An object that already matches is left untouched.
    pub async fn reconcile(&self, desc: &ResourceDescriptor, deadline: &Deadline) -> KeelResult<Reconciled> {
        self.reconcile_traced(desc, deadline).await.map_err(|f| f.error)
    }

    /// Like `reconcile`, but a failure also carries the last observation.
    pub async fn reconcile_traced(&self, desc: &ResourceDescriptor, deadline: &Deadline) -> Result<Reconciled, ReconcileFailure> {
        let t0 = Instant::now();
        counter!("reconcile_attempts", 1u64);
        let mut trace = Trace::default();
        let res = self.reconcile_with_retries(desc, deadline, &mut trace).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(r) => {
                match r.action {
                    ReconcileAction::Created => counter!("reconcile_created", 1u64),
                    ReconcileAction::Updated => counter!("reconcile_updated", 1u64),
                    ReconcileAction::Unchanged => counter!("reconcile_unchanged", 1u64),
                }
                info!(target_ref = %r.reference, action = r.action.as_str(), adds = r.summary.adds, updates = r.summary.updates, removes = r.summary.removes, "reconciled");
            }
            Err(e) => {
                counter!("reconcile_err", 1u64);
                warn!(target_ref = %desc.reference, error = %e, "reconcile failed");
            }
        }
        res.map_err(|error| ReconcileFailure { error, last_observed: trace.summary() })
    }

    async fn reconcile_with_retries(&self, desc: &ResourceDescriptor, deadline: &Deadline, trace: &mut Trace) -> KeelResult<Reconciled> {
        let r = &desc.reference;
        let mut desired = strip_noisy(desc.desired.clone());
        fold_string_data(r.kind, &mut desired);

        let mut conflicts = 0u32;
        let mut backoff = self.policy.initial_backoff;
        loop {
            match self.attempt(r, &desired, deadline, trace).await {
                Ok(done) => return Ok(done),
                Err(KeelError::Conflict(msg)) if conflicts < self.policy.conflict_retries => {
                    conflicts += 1;
                    trace.last_error = Some(msg.clone());
                    counter!("reconcile_conflict_retries", 1u64);
                    debug!(target_ref = %r, attempt = conflicts, "write conflict; re-fetching: {}", msg);
                }
                Err(KeelError::Unavailable(msg)) => {
                    trace.last_error = Some(msg.clone());
                    warn!(target_ref = %r, backoff_ms = backoff.as_millis() as u64, "control plane unavailable: {}", msg);
                    if !deadline.sleep(backoff).await {
                        return Err(KeelError::Timeout(format!("{}: gave up while control plane unavailable ({})", r, msg)));
                    }
                    backoff = (backoff * 2).min(self.policy.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, r: &ResourceRef, desired: &Json, deadline: &Deadline, trace: &mut Trace) -> KeelResult<Reconciled> {
        let live = deadline.run(&format!("get {}", r), self.cp.get(r)).await?;
        trace.saw(live.as_ref());
        let Some(live) = live else {
            let state = deadline.run(&format!("create {}", r), self.cp.create(r, desired)).await?;
            let summary = diff_summary(&strip_noisy(desired.clone()), &json!({}));
            return Ok(Reconciled { reference: r.clone(), action: ReconcileAction::Created, state, summary });
        };

        let merged = merge_onto_live(r.kind, &live, desired);
        let summary = diff_summary(&strip_noisy(merged.clone()), &strip_noisy(live.clone()));
        if converged(&live, &merged) {
            return Ok(Reconciled { reference: r.clone(), action: ReconcileAction::Unchanged, state: live, summary: DiffSummary::default() });
        }
        debug!(target_ref = %r, rv = ?live.pointer("/metadata/resourceVersion"), "replacing");
        let state = deadline.run(&format!("update {}", r), self.cp.update(r, &merged)).await?;
        Ok(Reconciled { reference: r.clone(), action: ReconcileAction::Updated, state, summary })
    }
}
