//! In-process control plane with API-server-like semantics: server-assigned
//! metadata, resourceVersion conflicts, immutable fields, scripted faults.

use std::collections::BTreeMap;
use std::sync::Mutex;

use keel_core::{KeelError, KeelResult, ResourceKind, ResourceRef};
use serde_json::{json, Value as Json};
use uuid::Uuid;

use crate::ControlPlane;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Update,
}

/// One recorded call against the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub reference: ResourceRef,
}

/// Scripted failure returned instead of performing the call.
#[derive(Debug, Clone)]
pub struct Fault {
    verb: Verb,
    kind: Option<ResourceKind>,
    name: Option<String>,
    times: usize,
    error: KeelError,
}

impl Fault {
    pub fn on(verb: Verb, error: KeelError) -> Self {
        Self { verb, kind: None, name: None, times: 1, error }
    }
    pub fn kind(mut self, kind: ResourceKind) -> Self { self.kind = Some(kind); self }
    pub fn name(mut self, name: &str) -> Self { self.name = Some(name.to_string()); self }
    pub fn times(mut self, n: usize) -> Self { self.times = n; self }
    /// Keep failing for the lifetime of the fake.
    pub fn always(mut self) -> Self { self.times = usize::MAX; self }

    fn matches(&self, verb: Verb, r: &ResourceRef) -> bool {
        self.times > 0
            && self.verb == verb
            && self.kind.map(|k| k == r.kind).unwrap_or(true)
            && self.name.as_deref().map(|n| n == r.name).unwrap_or(true)
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceRef, Json>,
    rv: u64,
    next_ip: u32,
    calls: Vec<Call>,
    faults: Vec<Fault>,
    simulate_readiness: bool,
}

#[derive(Default)]
pub struct MemoryControlPlane {
    state: Mutex<State>,
}

impl MemoryControlPlane {
    pub fn new() -> Self { Self::default() }

    /// Workloads report all replicas ready and Services get one endpoint
    /// address as soon as they are written.
    pub fn with_simulated_readiness() -> Self {
        let me = Self::default();
        me.lock().simulate_readiness = true;
        me
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked; the data is still usable.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn inject(&self, fault: Fault) { self.lock().faults.push(fault); }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    /// Create and Update calls only, in order.
    pub fn mutations(&self) -> Vec<Call> {
        self.lock().calls.iter().filter(|c| c.verb != Verb::Get).cloned().collect()
    }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    pub fn object(&self, r: &ResourceRef) -> Option<Json> { self.lock().objects.get(r).cloned() }

    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    /// Insert an object as if some other client had created it.
    pub fn seed(&self, r: &ResourceRef, object: Json) -> Json {
        let mut st = self.lock();
        let stored = st.admit(r, object);
        st.objects.insert(r.clone(), stored.clone());
        stored
    }

    /// Out-of-band write from another client; bumps resourceVersion.
    pub fn modify_external<F: FnOnce(&mut Json)>(&self, r: &ResourceRef, f: F) -> bool {
        let mut st = self.lock();
        st.rv += 1;
        let rv = st.rv.to_string();
        match st.objects.get_mut(r) {
            Some(obj) => {
                f(obj);
                obj["metadata"]["resourceVersion"] = Json::String(rv);
                true
            }
            None => false,
        }
    }

    pub fn set_status(&self, r: &ResourceRef, status: Json) -> bool {
        self.modify_external(r, |obj| {
            if let Some(o) = obj.as_object_mut() { o.insert("status".into(), status); }
        })
    }

    /// Publish an Endpoints object with `ready` ready and `not_ready` not-ready addresses.
    pub fn put_endpoints(&self, namespace: &str, name: &str, ready: usize, not_ready: usize) {
        let r = ResourceRef::namespaced(ResourceKind::Endpoints, namespace, name);
        let mut st = self.lock();
        let obj = st.endpoints_object(&r, ready, not_ready);
        let stored = st.admit(&r, obj);
        st.objects.insert(r, stored);
    }

    fn record(&self, verb: Verb, r: &ResourceRef) -> KeelResult<std::sync::MutexGuard<'_, State>> {
        let mut st = self.lock();
        st.calls.push(Call { verb, reference: r.clone() });
        if let Some(f) = st.faults.iter_mut().find(|f| f.matches(verb, r)) {
            if f.times != usize::MAX { f.times -= 1; }
            return Err(f.error.clone());
        }
        Ok(st)
    }
}

impl State {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn next_ip(&mut self, prefix: &str) -> String {
        self.next_ip += 1;
        format!("{}.{}.{}", prefix, self.next_ip / 250, self.next_ip % 250 + 1)
    }

    /// Fill server-owned fields for a newly stored object.
    fn admit(&mut self, r: &ResourceRef, mut obj: Json) -> Json {
        if !obj.is_object() { obj = json!({}); }
        obj["apiVersion"] = Json::String(r.kind.api_version());
        obj["kind"] = Json::String(r.kind.wire_kind().to_string());
        if !obj.get("metadata").map(|m| m.is_object()).unwrap_or(false) {
            obj["metadata"] = json!({});
        }
        let rv = self.next_rv();
        let meta = &mut obj["metadata"];
        meta["name"] = Json::String(r.name.clone());
        if let Some(ns) = &r.namespace { meta["namespace"] = Json::String(ns.clone()); }
        meta["uid"] = Json::String(Uuid::new_v4().to_string());
        meta["resourceVersion"] = Json::String(rv);
        meta["generation"] = json!(1);
        meta["creationTimestamp"] = Json::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        match r.kind {
            ResourceKind::Service => {
                let cur = obj.pointer("/spec/clusterIP").and_then(|v| v.as_str()).unwrap_or("");
                if cur.is_empty() {
                    let ip = self.next_ip("10.96");
                    obj["spec"]["clusterIP"] = Json::String(ip.clone());
                    obj["spec"]["clusterIPs"] = json!([ip]);
                }
            }
            ResourceKind::Route => {
                if obj.pointer("/spec/host").and_then(|v| v.as_str()).map(|s| s.is_empty()).unwrap_or(true) {
                    let host = format!("{}-{}.apps.local", r.name, r.namespace.as_deref().unwrap_or("default"));
                    obj["spec"]["host"] = Json::String(host);
                }
            }
            _ => {}
        }
        obj
    }

    fn endpoints_object(&mut self, r: &ResourceRef, ready: usize, not_ready: usize) -> Json {
        let addrs: Vec<Json> = (0..ready).map(|_| json!({"ip": self.next_ip("10.244")})).collect();
        let pending: Vec<Json> = (0..not_ready).map(|_| json!({"ip": self.next_ip("10.244")})).collect();
        let mut subset = json!({"ports": [{"port": 8080}]});
        if !addrs.is_empty() { subset["addresses"] = Json::Array(addrs); }
        if !pending.is_empty() { subset["notReadyAddresses"] = Json::Array(pending); }
        json!({"metadata": {"name": r.name, "namespace": r.namespace}, "subsets": [subset]})
    }

    fn simulate(&mut self, r: &ResourceRef) {
        if !self.simulate_readiness { return; }
        match r.kind {
            ResourceKind::Workload => {
                if let Some(obj) = self.objects.get_mut(r) {
                    let want = obj.pointer("/spec/replicas").and_then(|v| v.as_i64()).unwrap_or(1);
                    obj["status"] = json!({
                        "replicas": want,
                        "readyReplicas": want,
                        "availableReplicas": want,
                        "updatedReplicas": want,
                    });
                }
            }
            ResourceKind::Service => {
                let ep = r.with_kind(ResourceKind::Endpoints);
                if !self.objects.contains_key(&ep) {
                    let obj = self.endpoints_object(&ep, 1, 0);
                    let stored = self.admit(&ep, obj);
                    self.objects.insert(ep, stored);
                }
            }
            _ => {}
        }
    }
}

fn strip_server_fields(obj: &Json) -> Json {
    let mut v = obj.clone();
    if let Some(o) = v.as_object_mut() { o.remove("status"); }
    v
}

#[async_trait::async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn get(&self, r: &ResourceRef) -> KeelResult<Option<Json>> {
        let st = self.record(Verb::Get, r)?;
        Ok(st.objects.get(r).cloned())
    }

    async fn create(&self, r: &ResourceRef, object: &Json) -> KeelResult<Json> {
        let mut st = self.record(Verb::Create, r)?;
        if st.objects.contains_key(r) {
            return Err(KeelError::Conflict(format!("{}: already exists", r)));
        }
        let stored = st.admit(r, strip_server_fields(object));
        st.objects.insert(r.clone(), stored);
        st.simulate(r);
        Ok(st.objects.get(r).cloned().unwrap_or(Json::Null))
    }

    async fn update(&self, r: &ResourceRef, object: &Json) -> KeelResult<Json> {
        let mut st = self.record(Verb::Update, r)?;
        let live = st.objects.get(r).cloned()
            .ok_or_else(|| KeelError::NotFound(format!("{}: not found", r)))?;
        let live_rv = live.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).unwrap_or("");
        let sent_rv = object.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).unwrap_or("");
        if sent_rv != live_rv {
            return Err(KeelError::Conflict(format!(
                "{}: the object has been modified (rv {} != {}); please apply your changes to the latest version",
                r, sent_rv, live_rv
            )));
        }
        for ptr in r.kind.immutable_fields() {
            if let Some(old) = live.pointer(ptr) {
                if object.pointer(ptr) != Some(old) {
                    return Err(KeelError::Validation(format!("{}: {}: field is immutable", r, ptr.trim_start_matches('/').replace('/', "."))));
                }
            }
        }
        let mut next = strip_server_fields(object);
        next["metadata"]["uid"] = live["metadata"]["uid"].clone();
        next["metadata"]["creationTimestamp"] = live["metadata"]["creationTimestamp"].clone();
        let generation = live.pointer("/metadata/generation").and_then(|v| v.as_i64()).unwrap_or(1);
        let bump = next.get("spec") != live.get("spec");
        next["metadata"]["generation"] = json!(if bump { generation + 1 } else { generation });
        next["metadata"]["resourceVersion"] = Json::String(st.next_rv());
        if let Some(status) = live.get("status") { next["status"] = status.clone(); }
        st.objects.insert(r.clone(), next);
        st.simulate(r);
        Ok(st.objects.get(r).cloned().unwrap_or(Json::Null))
    }
}
