//! Multi-document YAML to descriptors.

use keel_core::{KeelError, KeelResult, ResourceDescriptor};
use serde::Deserialize;
use serde_json::Value as Json;

/// Size guards applied before a manifest stream is converted.
#[derive(Debug, Clone, Copy)]
pub struct ManifestLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for ManifestLimits {
    fn default() -> Self { Self { max_bytes: 1_000_000, max_nodes: 100_000 } }
}

/// Parse a `---` separated YAML stream into descriptors.
///
/// Empty documents are skipped and `v1 List` documents are flattened.
/// `namespace_override` fills the namespace of namespaced objects that do
/// not carry one.
pub fn parse_manifests(yaml: &str, namespace_override: Option<&str>, limits: &ManifestLimits) -> KeelResult<Vec<ResourceDescriptor>> {
    if yaml.len() > limits.max_bytes {
        return Err(KeelError::Validation(format!("YAML payload too large (>{} bytes)", limits.max_bytes)));
    }
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc)
            .map_err(|e| KeelError::Validation(format!("document {}: parsing YAML: {}", idx + 1, e)))?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val)
            .map_err(|e| KeelError::Validation(format!("document {}: converting YAML to JSON: {}", idx + 1, e)))?;
        if json_node_budget_exceeded(&json, limits.max_nodes) {
            return Err(KeelError::Validation(format!("document {}: YAML document too complex (>{} nodes)", idx + 1, limits.max_nodes)));
        }
        let items = match json.get("kind").and_then(|k| k.as_str()) {
            Some("List") => json.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default(),
            _ => vec![json],
        };
        for item in items {
            let d = ResourceDescriptor::from_manifest(item, namespace_override)
                .map_err(|e| match e {
                    KeelError::Validation(m) => KeelError::Validation(format!("document {}: {}", idx + 1, m)),
                    other => other,
                })?;
            out.push(d);
        }
    }
    if out.is_empty() {
        return Err(KeelError::Validation("no resources found in manifest".into()));
    }
    Ok(out)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ResourceKind;

    const STACK: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: demo
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: chat-config
data:
  MODEL: granite
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: chat
  namespace: other
spec:
  replicas: 1
---
"#;

    #[test]
    fn parses_multi_document_stream() {
        let ds = parse_manifests(STACK, None, &ManifestLimits::default()).unwrap();
        assert_eq!(ds.len(), 3);
        // scope is checked when the plan is built
        assert_eq!(ds[1].namespace(), None);
        assert_eq!(ds[2].namespace(), Some("other"));

        let ds = parse_manifests(STACK, Some("demo"), &ManifestLimits::default()).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds[0].kind(), ResourceKind::Namespace);
        assert_eq!(ds[0].namespace(), None);
        assert_eq!(ds[1].namespace(), Some("demo"));
        assert_eq!(ds[2].kind(), ResourceKind::Workload);
        assert_eq!(ds[2].namespace(), Some("other"));
        assert_eq!(ds[1].desired["metadata"]["namespace"], "demo");
    }

    #[test]
    fn flattens_lists() {
        let y = "apiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: ConfigMap\n  metadata: {name: a, namespace: x}\n- apiVersion: v1\n  kind: Secret\n  metadata: {name: b, namespace: x}\n";
        let ds = parse_manifests(y, None, &ManifestLimits::default()).unwrap();
        assert_eq!(ds.iter().map(|d| d.kind()).collect::<Vec<_>>(), vec![ResourceKind::ConfigMap, ResourceKind::Secret]);
    }

    #[test]
    fn enforces_limits() {
        let tight = ManifestLimits { max_bytes: 10, max_nodes: 100 };
        let e = parse_manifests(STACK, Some("demo"), &tight).unwrap_err();
        assert!(e.to_string().contains("too large"), "{}", e);

        let few = ManifestLimits { max_bytes: 1_000_000, max_nodes: 3 };
        let e = parse_manifests(STACK, Some("demo"), &few).unwrap_err();
        assert!(e.to_string().contains("too complex"), "{}", e);
    }

    #[test]
    fn empty_stream_is_rejected() {
        let e = parse_manifests("---\n---\n", None, &ManifestLimits::default()).unwrap_err();
        assert!(e.to_string().contains("no resources"), "{}", e);
    }

    #[test]
    fn unsupported_kind_names_document() {
        let e = parse_manifests("apiVersion: batch/v1\nkind: Job\nmetadata: {name: j}\n", Some("x"), &ManifestLimits::default()).unwrap_err();
        assert!(e.to_string().contains("document 1"), "{}", e);
        assert!(e.to_string().contains("unsupported kind"), "{}", e);
    }
}
