use std::fmt;

use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::core::v1::EndpointSubset;
use keel_core::{KeelError, KeelResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Replica counts of a workload as reported by the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub desired: i32,
    pub ready: i32,
    pub updated: i32,
    pub available: i32,
}

impl WorkloadStatus {
    pub fn from_object(obj: &Json) -> KeelResult<Self> {
        let desired = match obj.pointer("/spec/replicas") {
            None | Some(Json::Null) => 1,
            Some(v) => v.as_i64().and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| KeelError::Internal(format!("spec.replicas is not a 32-bit integer: {}", v)))?,
        };
        let status: DeploymentStatus = match obj.get("status") {
            Some(s) if !s.is_null() => serde_json::from_value(s.clone())
                .map_err(|e| KeelError::Internal(format!("decoding workload status: {}", e)))?,
            _ => DeploymentStatus::default(),
        };
        Ok(Self {
            desired,
            ready: status.ready_replicas.unwrap_or(0),
            updated: status.updated_replicas.unwrap_or(0),
            available: status.available_replicas.unwrap_or(0),
        })
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} replicas ready", self.ready, self.desired)
    }
}

/// At least one replica reports ready.
pub fn workload_ready(s: &WorkloadStatus) -> bool { s.ready >= 1 }

/// Addresses registered behind a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub ready: usize,
    pub not_ready: usize,
}

impl EndpointStatus {
    /// An absent Endpoints object counts as zero addresses.
    pub fn from_object(obj: Option<&Json>) -> KeelResult<Self> {
        let Some(subsets) = obj.and_then(|o| o.get("subsets")).filter(|s| !s.is_null()) else {
            return Ok(Self::default());
        };
        let subsets: Vec<EndpointSubset> = serde_json::from_value(subsets.clone())
            .map_err(|e| KeelError::Internal(format!("decoding endpoint subsets: {}", e)))?;
        let mut out = Self::default();
        for s in subsets {
            out.ready += s.addresses.map(|a| a.len()).unwrap_or(0);
            out.not_ready += s.not_ready_addresses.map(|a| a.len()).unwrap_or(0);
        }
        Ok(out)
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ready addresses ({} not ready)", self.ready, self.not_ready)
    }
}

/// At least one routable address is registered.
pub fn endpoints_ready(s: &EndpointStatus) -> bool { s.ready >= 1 }
