use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{KeelError, KeelResult, ResourceDescriptor, ResourceKind, ResourceRef};

static DNS1123_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));
static DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex")
});

/// Ordered set of descriptors for one application.
///
/// Order is fixed by kind rank (Namespace, then configuration/storage/RBAC,
/// then the workload, the service and finally ingress/route). Within a rank
/// the caller's order is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawPlan")]
pub struct DeploymentPlan {
    steps: Vec<ResourceDescriptor>,
}

#[derive(Deserialize)]
struct RawPlan {
    steps: Vec<ResourceDescriptor>,
}

impl TryFrom<RawPlan> for DeploymentPlan {
    type Error = KeelError;

    fn try_from(raw: RawPlan) -> KeelResult<Self> { Self::new(raw.steps) }
}

impl DeploymentPlan {
    pub fn new(descriptors: Vec<ResourceDescriptor>) -> KeelResult<Self> {
        if descriptors.is_empty() {
            return Err(KeelError::Validation("plan has no resources".into()));
        }
        let mut seen: HashSet<&ResourceRef> = HashSet::new();
        for d in &descriptors {
            validate_ref(&d.reference)?;
            if !seen.insert(&d.reference) {
                return Err(KeelError::Validation(format!("duplicate resource in plan: {}", d.reference)));
            }
        }
        let mut steps = descriptors;
        steps.sort_by_key(|d| d.kind().rank());
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[ResourceDescriptor] { &self.steps }
    pub fn len(&self) -> usize { self.steps.len() }
    pub fn is_empty(&self) -> bool { self.steps.is_empty() }
    pub fn iter(&self) -> std::slice::Iter<'_, ResourceDescriptor> { self.steps.iter() }

    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceDescriptor> {
        self.steps.iter().filter(move |d| d.kind() == kind)
    }

    /// Indices of the steps that step `i` depends on: every lower-ranked
    /// step in the same namespace, including the Namespace object itself.
    pub fn dependencies_of(&self, i: usize) -> Vec<usize> {
        let Some(me) = self.steps.get(i) else { return Vec::new() };
        let scope = me.reference.scope();
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, d)| d.kind().rank() < me.kind().rank() && d.reference.scope() == scope)
            .map(|(j, _)| j)
            .collect()
    }

    /// True when no step precedes one of its dependencies.
    pub fn is_dependency_ordered(&self) -> bool {
        (0..self.steps.len()).all(|i| self.dependencies_of(i).into_iter().all(|j| j < i))
    }
}

impl<'a> IntoIterator for &'a DeploymentPlan {
    type Item = &'a ResourceDescriptor;
    type IntoIter = std::slice::Iter<'a, ResourceDescriptor>;
    fn into_iter(self) -> Self::IntoIter { self.steps.iter() }
}

fn validate_ref(r: &ResourceRef) -> KeelResult<()> {
    let info = r.kind.info();
    if info.observe_only {
        return Err(KeelError::Validation(format!("{} is observed only and cannot be planned", r.kind)));
    }
    match (&r.namespace, info.namespaced) {
        (None, true) => return Err(KeelError::Validation(format!("{}: namespace required for namespaced kind", r))),
        (Some(_), false) => return Err(KeelError::Validation(format!("{}: cluster-scoped kind cannot carry a namespace", r))),
        (Some(ns), true) => check_name(ns, true).map_err(|m| KeelError::Validation(format!("{}: namespace {}", r, m)))?,
        (None, false) => {}
    }
    // Namespaces and Services must be DNS labels; other kinds allow subdomains.
    let label_only = matches!(r.kind, ResourceKind::Namespace | ResourceKind::Service);
    check_name(&r.name, label_only).map_err(|m| KeelError::Validation(format!("{}: name {}", r, m)))
}

fn check_name(name: &str, label_only: bool) -> Result<(), String> {
    let (re, max) = if label_only { (&*DNS1123_LABEL, 63) } else { (&*DNS1123_SUBDOMAIN, 253) };
    if name.is_empty() || name.len() > max {
        return Err(format!("{:?} must be 1..={} characters", name, max));
    }
    if !re.is_match(name) {
        return Err(format!("{:?} is not a valid DNS-1123 name", name));
    }
    Ok(())
}
