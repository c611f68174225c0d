//! Closed table of resource kinds the reconciler knows how to drive.
//!
//! Every kind-specific decision (API coordinates, scope, dependency rank,
//! report stage, fields the control plane owns) lives here so that the
//! reconciler, waiter and orchestrator stay kind-agnostic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Step names surfaced in deploy reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Namespace,
    StorageConfig,
    Workload,
    Service,
    Exposure,
    Readiness,
    Verification,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Namespace => "Namespace",
            Stage::StorageConfig => "Storage/Config",
            Stage::Workload => "Workload",
            Stage::Service => "Service",
            Stage::Exposure => "Ingress/Route",
            Stage::Readiness => "Readiness",
            Stage::Verification => "Verification",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Namespace,
    ConfigMap,
    Secret,
    PersistentVolumeClaim,
    ServiceAccount,
    Role,
    RoleBinding,
    /// apps/v1 Deployment
    Workload,
    Service,
    Ingress,
    /// route.openshift.io/v1 Route
    Route,
    /// Observed by readiness gates only; never part of a plan.
    Endpoints,
}

/// Static per-kind facts.
#[derive(Debug, Clone, Copy)]
pub struct KindInfo {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
    pub rank: u8,
    pub stage: Stage,
    /// JSON pointers assigned or frozen by the control plane.
    pub immutable_fields: &'static [&'static str],
    pub observe_only: bool,
}

const NO_FIELDS: &[&str] = &[];

impl ResourceKind {
    pub const ALL: [ResourceKind; 12] = [
        ResourceKind::Namespace,
        ResourceKind::ConfigMap,
        ResourceKind::Secret,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::ServiceAccount,
        ResourceKind::Role,
        ResourceKind::RoleBinding,
        ResourceKind::Workload,
        ResourceKind::Service,
        ResourceKind::Ingress,
        ResourceKind::Route,
        ResourceKind::Endpoints,
    ];

    pub const fn info(self) -> KindInfo {
        match self {
            ResourceKind::Namespace => KindInfo {
                group: "", version: "v1", kind: "Namespace", plural: "namespaces",
                namespaced: false, rank: 0, stage: Stage::Namespace,
                immutable_fields: NO_FIELDS, observe_only: false,
            },
            ResourceKind::ConfigMap => KindInfo {
                group: "", version: "v1", kind: "ConfigMap", plural: "configmaps",
                namespaced: true, rank: 1, stage: Stage::StorageConfig,
                immutable_fields: NO_FIELDS, observe_only: false,
            },
            ResourceKind::Secret => KindInfo {
                group: "", version: "v1", kind: "Secret", plural: "secrets",
                namespaced: true, rank: 1, stage: Stage::StorageConfig,
                immutable_fields: &["/type"], observe_only: false,
            },
            ResourceKind::PersistentVolumeClaim => KindInfo {
                group: "", version: "v1", kind: "PersistentVolumeClaim", plural: "persistentvolumeclaims",
                namespaced: true, rank: 1, stage: Stage::StorageConfig,
                immutable_fields: &["/spec/volumeName", "/spec/storageClassName", "/spec/volumeMode"],
                observe_only: false,
            },
            ResourceKind::ServiceAccount => KindInfo {
                group: "", version: "v1", kind: "ServiceAccount", plural: "serviceaccounts",
                namespaced: true, rank: 1, stage: Stage::StorageConfig,
                immutable_fields: &["/secrets"], observe_only: false,
            },
            ResourceKind::Role => KindInfo {
                group: "rbac.authorization.k8s.io", version: "v1", kind: "Role", plural: "roles",
                namespaced: true, rank: 1, stage: Stage::StorageConfig,
                immutable_fields: NO_FIELDS, observe_only: false,
            },
            ResourceKind::RoleBinding => KindInfo {
                group: "rbac.authorization.k8s.io", version: "v1", kind: "RoleBinding", plural: "rolebindings",
                namespaced: true, rank: 1, stage: Stage::StorageConfig,
                immutable_fields: &["/roleRef"], observe_only: false,
            },
            ResourceKind::Workload => KindInfo {
                group: "apps", version: "v1", kind: "Deployment", plural: "deployments",
                namespaced: true, rank: 2, stage: Stage::Workload,
                immutable_fields: &["/spec/selector"], observe_only: false,
            },
            ResourceKind::Service => KindInfo {
                group: "", version: "v1", kind: "Service", plural: "services",
                namespaced: true, rank: 3, stage: Stage::Service,
                immutable_fields: &["/spec/clusterIP", "/spec/clusterIPs"], observe_only: false,
            },
            ResourceKind::Ingress => KindInfo {
                group: "networking.k8s.io", version: "v1", kind: "Ingress", plural: "ingresses",
                namespaced: true, rank: 4, stage: Stage::Exposure,
                immutable_fields: NO_FIELDS, observe_only: false,
            },
            ResourceKind::Route => KindInfo {
                group: "route.openshift.io", version: "v1", kind: "Route", plural: "routes",
                namespaced: true, rank: 4, stage: Stage::Exposure,
                immutable_fields: &["/spec/host"], observe_only: false,
            },
            ResourceKind::Endpoints => KindInfo {
                group: "", version: "v1", kind: "Endpoints", plural: "endpoints",
                namespaced: true, rank: u8::MAX, stage: Stage::Readiness,
                immutable_fields: NO_FIELDS, observe_only: true,
            },
        }
    }

    pub fn api_version(self) -> String {
        let i = self.info();
        if i.group.is_empty() { i.version.to_string() } else { format!("{}/{}", i.group, i.version) }
    }

    pub fn wire_kind(self) -> &'static str { self.info().kind }
    pub fn namespaced(self) -> bool { self.info().namespaced }
    pub fn rank(self) -> u8 { self.info().rank }
    pub fn stage(self) -> Stage { self.info().stage }
    pub fn immutable_fields(self) -> &'static [&'static str] { self.info().immutable_fields }
    pub fn is_exposure(self) -> bool { matches!(self, ResourceKind::Ingress | ResourceKind::Route) }

    /// Resolve from `apiVersion` + `kind` as they appear in a manifest.
    pub fn from_api_version_kind(api_version: &str, kind: &str) -> Option<Self> {
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        Self::ALL.into_iter().find(|k| {
            let i = k.info();
            i.group == group && i.version == version && i.kind == kind
        })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Workload => f.write_str("Workload"),
            other => f.write_str(other.wire_kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_core_and_grouped_kinds() {
        assert_eq!(ResourceKind::from_api_version_kind("v1", "ConfigMap"), Some(ResourceKind::ConfigMap));
        assert_eq!(ResourceKind::from_api_version_kind("apps/v1", "Deployment"), Some(ResourceKind::Workload));
        assert_eq!(ResourceKind::from_api_version_kind("route.openshift.io/v1", "Route"), Some(ResourceKind::Route));
        assert_eq!(ResourceKind::from_api_version_kind("apps/v1", "StatefulSet"), None);
        assert_eq!(ResourceKind::from_api_version_kind("v2", "ConfigMap"), None);
    }

    #[test]
    fn ranks_follow_dependency_tiers() {
        assert!(ResourceKind::Namespace.rank() < ResourceKind::ConfigMap.rank());
        assert_eq!(ResourceKind::PersistentVolumeClaim.rank(), ResourceKind::RoleBinding.rank());
        assert!(ResourceKind::RoleBinding.rank() < ResourceKind::Workload.rank());
        assert!(ResourceKind::Workload.rank() < ResourceKind::Service.rank());
        assert!(ResourceKind::Service.rank() < ResourceKind::Ingress.rank());
        assert_eq!(ResourceKind::Ingress.rank(), ResourceKind::Route.rank());
    }

    #[test]
    fn service_keeps_cluster_ip() {
        assert!(ResourceKind::Service.immutable_fields().contains(&"/spec/clusterIP"));
        assert!(ResourceKind::ConfigMap.immutable_fields().is_empty());
        assert_eq!(ResourceKind::Workload.api_version(), "apps/v1");
        assert_eq!(ResourceKind::Namespace.api_version(), "v1");
    }
}
