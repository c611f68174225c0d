//! Pure JSON helpers: merging desired state onto live state, convergence
//! checks and diff summaries.

use base64::Engine as _;
use keel_core::ResourceKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Metadata keys owned by the server; never taken from desired state.
const SERVER_META: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
];

/// Merge `desired` onto `live`.
///
/// Labels and annotations are unioned with desired winning per key. Every
/// other top-level field of `desired` (except identity and status) replaces
/// the live one. Fields in the kind's immutable set are then copied back
/// from `live`.
pub fn merge_onto_live(kind: ResourceKind, live: &Json, desired: &Json) -> Json {
    let mut merged = live.clone();
    let (Some(out), Some(want)) = (merged.as_object_mut(), desired.as_object()) else {
        return desired.clone();
    };
    for (k, v) in want {
        match k.as_str() {
            "apiVersion" | "kind" | "status" => {}
            "metadata" => merge_metadata(out, v),
            _ => { out.insert(k.clone(), v.clone()); }
        }
    }
    carry_immutable(kind, live, &mut merged);
    merged
}

fn merge_metadata(out: &mut Map<String, Json>, want: &Json) {
    let Some(want) = want.as_object() else { return };
    let meta = out.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    if !meta.is_object() { *meta = Json::Object(Map::new()); }
    let Some(meta) = meta.as_object_mut() else { return };
    for (k, v) in want {
        match k.as_str() {
            "labels" | "annotations" => {
                let slot = meta.entry(k.clone()).or_insert_with(|| Json::Object(Map::new()));
                if !slot.is_object() { *slot = Json::Object(Map::new()); }
                if let (Some(have), Some(add)) = (slot.as_object_mut(), v.as_object()) {
                    for (lk, lv) in add { have.insert(lk.clone(), lv.clone()); }
                }
            }
            k if SERVER_META.contains(&k) => {}
            _ => { meta.insert(k.clone(), v.clone()); }
        }
    }
}

/// Copy every immutable field present in `live` into `merged`.
pub(crate) fn carry_immutable(kind: ResourceKind, live: &Json, merged: &mut Json) {
    for ptr in kind.immutable_fields() {
        if let Some(v) = live.pointer(ptr) {
            set_pointer(merged, ptr, v.clone());
        }
    }
}

/// Set the value at an RFC 6901 pointer, creating intermediate objects.
pub(crate) fn set_pointer(target: &mut Json, ptr: &str, value: Json) {
    let tokens: Vec<String> = ptr
        .split('/')
        .skip(1)
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect();
    let Some((last, parents)) = tokens.split_last() else {
        *target = value;
        return;
    };
    let mut cur = target;
    for t in parents {
        if !cur.is_object() { *cur = Json::Object(Map::new()); }
        let Some(obj) = cur.as_object_mut() else { return };
        cur = obj.entry(t.clone()).or_insert_with(|| Json::Object(Map::new()));
    }
    if !cur.is_object() { *cur = Json::Object(Map::new()); }
    if let Some(obj) = cur.as_object_mut() {
        obj.insert(last.clone(), value);
    }
}

/// `have` already holds everything in `want`: objects by key subset,
/// arrays element-wise with equal length, scalars by equality.
pub(crate) fn json_contains(have: &Json, want: &Json) -> bool {
    match (have, want) {
        (Json::Object(h), Json::Object(w)) => w.iter().all(|(k, wv)| match h.get(k) {
            Some(hv) => json_contains(hv, wv),
            None => wv.is_null(),
        }),
        (Json::Array(h), Json::Array(w)) => h.len() == w.len() && h.iter().zip(w).all(|(a, b)| json_contains(a, b)),
        (h, w) => h == w,
    }
}

/// True when submitting `merged` would not change `live`.
pub fn converged(live: &Json, merged: &Json) -> bool {
    json_contains(&strip_noisy(live.clone()), &strip_noisy(merged.clone()))
}

/// The API server folds Secret `stringData` into base64 `data`; do the same
/// up front so the convergence check compares like with like.
pub fn fold_string_data(kind: ResourceKind, desired: &mut Json) {
    if kind != ResourceKind::Secret { return; }
    let Some(obj) = desired.as_object_mut() else { return };
    let Some(Json::Object(plain)) = obj.remove("stringData") else { return };
    let data = obj.entry("data").or_insert_with(|| Json::Object(Map::new()));
    if !data.is_object() { *data = Json::Object(Map::new()); }
    if let Some(data) = data.as_object_mut() {
        for (k, v) in plain {
            let raw = match v {
                Json::String(s) => s,
                other => other.to_string(),
            };
            data.insert(k, Json::String(base64::engine::general_purpose::STANDARD.encode(raw)));
        }
    }
}

pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in SERVER_META { meta.remove(*k); }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_update_keeps_cluster_ip_and_takes_new_ports() {
        let live = json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "web", "namespace": "demo", "resourceVersion": "7", "uid": "u-1"},
            "spec": {"clusterIP": "10.96.0.12", "clusterIPs": ["10.96.0.12"], "ports": [{"port": 80}], "type": "ClusterIP"}
        });
        let desired = json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "web", "namespace": "demo"},
            "spec": {"ports": [{"port": 80}, {"port": 8081}], "selector": {"app": "web"}}
        });
        let merged = merge_onto_live(ResourceKind::Service, &live, &desired);
        assert_eq!(merged["spec"]["clusterIP"], "10.96.0.12");
        assert_eq!(merged["spec"]["clusterIPs"], json!(["10.96.0.12"]));
        assert_eq!(merged["spec"]["ports"].as_array().unwrap().len(), 2);
        assert_eq!(merged["metadata"]["resourceVersion"], "7");
        assert_eq!(merged["metadata"]["uid"], "u-1");
    }

    #[test]
    fn annotations_and_labels_are_unioned() {
        let live = json!({"metadata": {"name": "x", "annotations": {"external/owner": "ops", "timeout": "60s"}, "labels": {"team": "a"}}});
        let desired = json!({"metadata": {"name": "x", "annotations": {"timeout": "120s"}, "labels": {"app": "x"}}});
        let merged = merge_onto_live(ResourceKind::Ingress, &live, &desired);
        assert_eq!(merged["metadata"]["annotations"], json!({"external/owner": "ops", "timeout": "120s"}));
        assert_eq!(merged["metadata"]["labels"], json!({"team": "a", "app": "x"}));
    }

    #[test]
    fn server_metadata_in_desired_is_ignored() {
        let live = json!({"metadata": {"name": "x", "resourceVersion": "5"}});
        let desired = json!({"metadata": {"name": "x", "resourceVersion": "1", "finalizers": ["a/b"]}});
        let merged = merge_onto_live(ResourceKind::ConfigMap, &live, &desired);
        assert_eq!(merged["metadata"]["resourceVersion"], "5");
        assert_eq!(merged["metadata"]["finalizers"], json!(["a/b"]));
    }

    #[test]
    fn convergence_ignores_server_defaults() {
        let live = json!({
            "metadata": {"name": "w", "resourceVersion": "3", "generation": 2},
            "spec": {"replicas": 1, "strategy": {"type": "RollingUpdate"}, "selector": {"matchLabels": {"app": "w"}}},
            "status": {"readyReplicas": 1}
        });
        let desired = json!({"metadata": {"name": "w"}, "spec": {"replicas": 1, "selector": {"matchLabels": {"app": "w"}}}});
        assert!(json_contains(&live["spec"], &desired["spec"]));
        let merged = merge_onto_live(ResourceKind::Workload, &live, &desired);
        // `spec` is replaced wholesale, so the defaulted strategy disappears
        // from merged, but live still contains everything merged asks for.
        assert!(converged(&live, &merged));

        let changed = json!({"metadata": {"name": "w"}, "spec": {"replicas": 3, "selector": {"matchLabels": {"app": "w"}}}});
        assert!(!converged(&live, &merge_onto_live(ResourceKind::Workload, &live, &changed)));
    }

    #[test]
    fn set_pointer_creates_parents() {
        let mut v = json!({});
        set_pointer(&mut v, "/spec/clusterIP", json!("10.0.0.1"));
        assert_eq!(v, json!({"spec": {"clusterIP": "10.0.0.1"}}));
        set_pointer(&mut v, "/metadata/annotations/a~1b", json!("c"));
        assert_eq!(v["metadata"]["annotations"]["a/b"], "c");
    }

    #[test]
    fn string_data_folds_into_base64_data() {
        let mut s = json!({"stringData": {"token": "abc"}, "data": {"old": "eA=="}});
        fold_string_data(ResourceKind::Secret, &mut s);
        assert!(s.get("stringData").is_none());
        assert_eq!(s["data"]["token"], "YWJj");
        assert_eq!(s["data"]["old"], "eA==");

        let mut cm = json!({"stringData": {"token": "abc"}});
        fold_string_data(ResourceKind::ConfigMap, &mut cm);
        assert!(cm.get("stringData").is_some());
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert!(diff_summary(&base, &base).is_empty());
    }

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "metadata": {"name": "x", "managedFields": [{}], "resourceVersion": "1", "generation": 5, "creationTimestamp": "t", "uid": "u"},
            "status": {"ok": true},
            "data": {"k": "v"}
        });
        let pruned = strip_noisy(v);
        assert_eq!(pruned, json!({"metadata": {"name": "x"}, "data": {"k": "v"}}));
    }
}
