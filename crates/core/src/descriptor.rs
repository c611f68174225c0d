use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::fmt;

use crate::{KeelError, KeelResult, ResourceKind};

/// Identity of a control-plane object: `(kind, namespace, name)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespaced(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self::new(kind, Some(namespace), name)
    }

    pub fn cluster(kind: ResourceKind, name: &str) -> Self { Self::new(kind, None, name) }

    /// Same namespace/name under a different kind (e.g. Service -> Endpoints).
    pub fn with_kind(&self, kind: ResourceKind) -> Self {
        Self { kind, namespace: self.namespace.clone(), name: self.name.clone() }
    }

    /// Namespace this object lives in, or its own name for a Namespace.
    pub fn scope(&self) -> Option<&str> {
        match self.kind {
            ResourceKind::Namespace => Some(self.name.as_str()),
            _ => self.namespace.as_deref(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Desired state for one object. The payload is opaque apart from the
/// identity fields, which are forced to agree with `reference`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawDescriptor")]
pub struct ResourceDescriptor {
    pub reference: ResourceRef,
    pub desired: Json,
}

#[derive(Deserialize)]
struct RawDescriptor {
    reference: ResourceRef,
    #[serde(default)]
    desired: Json,
}

impl TryFrom<RawDescriptor> for ResourceDescriptor {
    type Error = KeelError;

    fn try_from(raw: RawDescriptor) -> KeelResult<Self> {
        let desired = normalize(&raw.reference, raw.desired)?;
        Ok(Self { reference: raw.reference, desired })
    }
}

impl ResourceDescriptor {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str, desired: Json) -> KeelResult<Self> {
        let reference = ResourceRef::new(kind, namespace, name);
        let desired = normalize(&reference, desired)?;
        Ok(Self { reference, desired })
    }

    /// Build from a full manifest object (`apiVersion`, `kind`, `metadata`).
    /// `ns_default` fills the namespace of namespaced kinds that omit it.
    pub fn from_manifest(manifest: Json, ns_default: Option<&str>) -> KeelResult<Self> {
        let api_version = manifest.get("apiVersion").and_then(|v| v.as_str())
            .ok_or_else(|| KeelError::Validation("manifest missing apiVersion".into()))?;
        let kind_s = manifest.get("kind").and_then(|v| v.as_str())
            .ok_or_else(|| KeelError::Validation("manifest missing kind".into()))?;
        let kind = ResourceKind::from_api_version_kind(api_version, kind_s)
            .ok_or_else(|| KeelError::Validation(format!("unsupported kind {}/{}", api_version, kind_s)))?;
        let meta = manifest.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str())
            .ok_or_else(|| KeelError::Validation("manifest missing metadata.name".into()))?
            .to_string();
        let ns = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(|s| s.to_string())
            .or_else(|| if kind.namespaced() { ns_default.map(|s| s.to_string()) } else { None });
        Self::new(kind, ns.as_deref(), &name, manifest)
    }

    pub fn kind(&self) -> ResourceKind { self.reference.kind }
    pub fn name(&self) -> &str { &self.reference.name }
    pub fn namespace(&self) -> Option<&str> { self.reference.namespace.as_deref() }
}

fn normalize(r: &ResourceRef, desired: Json) -> KeelResult<Json> {
    let mut obj = match desired {
        Json::Object(m) => m,
        Json::Null => Map::new(),
        other => return Err(KeelError::Validation(format!("{}: desired state must be an object, got {}", r, type_name(&other)))),
    };
    obj.insert("apiVersion".into(), Json::String(r.kind.api_version()));
    obj.insert("kind".into(), Json::String(r.kind.wire_kind().to_string()));
    let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    let meta = meta.as_object_mut()
        .ok_or_else(|| KeelError::Validation(format!("{}: metadata must be an object", r)))?;
    meta.insert("name".into(), Json::String(r.name.clone()));
    match &r.namespace {
        Some(ns) => { meta.insert("namespace".into(), Json::String(ns.clone())); }
        None => { meta.remove("namespace"); }
    }
    Ok(Json::Object(obj))
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
