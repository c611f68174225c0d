//! Keel ops: the readiness waiter and the two gates the orchestrator uses.

#![forbid(unsafe_code)]

use std::time::Duration;

use keel_core::{Deadline, KeelError, ResourceKind, ResourceRef};
use keel_kubehub::ControlPlane;

mod status;
mod waiter;

pub use status::{endpoints_ready, workload_ready, EndpointStatus, WorkloadStatus};
pub use waiter::{wait_until, Observed, WaitFailure};

/// Wait until the workload at `r` reports at least one ready replica.
pub async fn watch_workload(
    cp: &dyn ControlPlane,
    r: &ResourceRef,
    interval: Duration,
    deadline: &Deadline,
) -> Result<Observed<WorkloadStatus>, WaitFailure<WorkloadStatus>> {
    let what = format!("{} readiness", r);
    wait_until(
        &what,
        || async move {
            let obj = cp.get(r).await?
                .ok_or_else(|| KeelError::NotFound(format!("{}: not found", r)))?;
            WorkloadStatus::from_object(&obj)
        },
        workload_ready,
        interval,
        deadline,
    ).await
}

/// Wait until the service at `r` has at least one ready endpoint address.
pub async fn watch_endpoints(
    cp: &dyn ControlPlane,
    r: &ResourceRef,
    interval: Duration,
    deadline: &Deadline,
) -> Result<Observed<EndpointStatus>, WaitFailure<EndpointStatus>> {
    let ep = r.with_kind(ResourceKind::Endpoints);
    let what = format!("{} endpoints", r);
    wait_until(
        &what,
        || {
            let ep = &ep;
            async move {
                let obj = cp.get(ep).await?;
                EndpointStatus::from_object(obj.as_ref())
            }
        },
        endpoints_ready,
        interval,
        deadline,
    ).await
}
