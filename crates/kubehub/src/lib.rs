//! Keel kubehub: the control-plane capability the reconciler drives, plus a
//! kube-rs implementation and an in-memory stand-in.

#![forbid(unsafe_code)]

use anyhow::Context;
use keel_core::{KeelError, KeelResult, ResourceKind, ResourceRef};
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use serde_json::Value as Json;
use tracing::debug;

mod memory;

pub use memory::{Call, Fault, MemoryControlPlane, Verb};

/// The three verbs the core needs from a resource-oriented,
/// optimistic-concurrency API.
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch live state; an absent object is `Ok(None)`, not an error.
    async fn get(&self, reference: &ResourceRef) -> KeelResult<Option<Json>>;

    async fn create(&self, reference: &ResourceRef, object: &Json) -> KeelResult<Json>;

    /// Full replace. `object.metadata.resourceVersion` must match the live
    /// object or the control plane answers `Conflict`.
    async fn update(&self, reference: &ResourceRef, object: &Json) -> KeelResult<Json>;
}

/// `ControlPlane` over a Kubernetes-compatible API server.
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
    field_manager: String,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self { Self { client, field_manager: "keel".to_string() } }

    /// Connect using the ambient kubeconfig / in-cluster config.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    pub fn with_field_manager(mut self, name: &str) -> Self {
        self.field_manager = name.to_string();
        self
    }

    fn api(&self, r: &ResourceRef) -> KeelResult<Api<DynamicObject>> {
        let ar = api_resource(r.kind);
        match (&r.namespace, r.kind.namespaced()) {
            (Some(ns), true) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            (None, true) => Err(KeelError::Validation(format!("{}: namespace required for namespaced kind", r))),
            (_, false) => Ok(Api::all_with(self.client.clone(), &ar)),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() }
    }
}

pub fn api_resource(kind: ResourceKind) -> ApiResource {
    let i = kind.info();
    let gvk = GroupVersionKind::gvk(i.group, i.version, i.kind);
    ApiResource::from_gvk_with_plural(&gvk, i.plural)
}

#[async_trait::async_trait]
impl ControlPlane for KubeControlPlane {
    async fn get(&self, r: &ResourceRef) -> KeelResult<Option<Json>> {
        let api = self.api(r)?;
        debug!(target_ref = %r, "get");
        match api.get_opt(&r.name).await {
            Ok(Some(obj)) => Ok(Some(serde_json::to_value(&obj).map_err(|e| KeelError::Internal(e.to_string()))?)),
            Ok(None) => Ok(None),
            Err(e) => Err(map_kube_error(e, r)),
        }
    }

    async fn create(&self, r: &ResourceRef, object: &Json) -> KeelResult<Json> {
        let api = self.api(r)?;
        let obj: DynamicObject = serde_json::from_value(object.clone())?;
        debug!(target_ref = %r, "create");
        let created = api.create(&self.post_params(), &obj).await.map_err(|e| map_kube_error(e, r))?;
        serde_json::to_value(&created).map_err(|e| KeelError::Internal(e.to_string()))
    }

    async fn update(&self, r: &ResourceRef, object: &Json) -> KeelResult<Json> {
        let api = self.api(r)?;
        let obj: DynamicObject = serde_json::from_value(object.clone())?;
        debug!(target_ref = %r, rv = ?obj.metadata.resource_version, "replace");
        let updated = api.replace(&r.name, &self.post_params(), &obj).await.map_err(|e| map_kube_error(e, r))?;
        serde_json::to_value(&updated).map_err(|e| KeelError::Internal(e.to_string()))
    }
}

/// Fold kube-rs errors into the shared taxonomy.
pub fn map_kube_error(e: kube::Error, r: &ResourceRef) -> KeelError {
    match e {
        kube::Error::Api(ae) => map_status(ae.code, &format!("{}: {} ({})", r, ae.message, ae.reason)),
        kube::Error::SerdeError(e) => KeelError::Internal(format!("{}: decoding response: {}", r, e)),
        other => KeelError::Unavailable(format!("{}: {}", r, other)),
    }
}

/// HTTP status of an API error response to the taxonomy.
pub fn map_status(code: u16, msg: &str) -> KeelError {
    match code {
        404 => KeelError::NotFound(msg.to_string()),
        409 => KeelError::Conflict(msg.to_string()),
        400 | 422 => KeelError::Validation(msg.to_string()),
        401 | 403 => KeelError::Forbidden(msg.to_string()),
        _ => KeelError::Unavailable(msg.to_string()),
    }
}
