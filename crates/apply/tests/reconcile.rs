use std::sync::Arc;
use std::time::Duration;

use keel_apply::{ReconcileAction, Reconciler, RetryPolicy};
use keel_core::{Deadline, KeelError, ResourceDescriptor, ResourceKind, ResourceRef};
use keel_kubehub::{Fault, MemoryControlPlane, Verb};
use serde_json::json;

fn fast() -> RetryPolicy {
    RetryPolicy { initial_backoff: Duration::from_millis(5), max_backoff: Duration::from_millis(20), conflict_retries: 1 }
}

fn setup() -> (Arc<MemoryControlPlane>, Reconciler) {
    let cp = Arc::new(MemoryControlPlane::new());
    let rec = Reconciler::new(cp.clone()).with_policy(fast());
    (cp, rec)
}

fn service(ports: serde_json::Value) -> ResourceDescriptor {
    ResourceDescriptor::new(
        ResourceKind::Service,
        Some("demo"),
        "web",
        json!({"metadata": {"labels": {"app": "web"}}, "spec": {"selector": {"app": "web"}, "ports": ports}}),
    ).unwrap()
}

fn workload(replicas: i64) -> ResourceDescriptor {
    ResourceDescriptor::new(
        ResourceKind::Workload,
        Some("demo"),
        "chat",
        json!({"spec": {
            "replicas": replicas,
            "selector": {"matchLabels": {"app": "chat"}},
            "template": {"metadata": {"labels": {"app": "chat"}}, "spec": {"containers": [{"name": "chat", "image": "chat:1"}]}}
        }}),
    ).unwrap()
}

fn dl() -> Deadline { Deadline::after(Duration::from_secs(10)) }

#[tokio::test]
async fn create_then_rerun_is_unchanged_without_writes() {
    let (cp, rec) = setup();
    let first = rec.reconcile(&workload(1), &dl()).await.unwrap();
    assert_eq!(first.action, ReconcileAction::Created);
    assert!(first.summary.adds > 0);
    cp.clear_calls();

    let second = rec.reconcile(&workload(1), &dl()).await.unwrap();
    assert_eq!(second.action, ReconcileAction::Unchanged);
    assert!(second.summary.is_empty());
    assert!(cp.mutations().is_empty(), "{:?}", cp.mutations());
    assert_eq!(
        second.state.pointer("/metadata/resourceVersion"),
        first.state.pointer("/metadata/resourceVersion"),
    );
}

#[tokio::test]
async fn changed_spec_is_updated_in_place() {
    let (cp, rec) = setup();
    let first = rec.reconcile(&workload(1), &dl()).await.unwrap();
    let uid = first.state.pointer("/metadata/uid").cloned();
    let out = rec.reconcile(&workload(3), &dl()).await.unwrap();
    assert_eq!(out.action, ReconcileAction::Updated);
    assert_eq!(out.summary.updates, 1);
    assert_eq!(out.state.pointer("/spec/replicas"), Some(&json!(3)));
    assert_eq!(out.state.pointer("/metadata/uid").cloned(), uid);
    assert_eq!(cp.len(), 1);
}

#[tokio::test]
async fn service_update_preserves_assigned_cluster_ip() {
    let (cp, rec) = setup();
    let r = ResourceRef::namespaced(ResourceKind::Service, "demo", "web");
    let seeded = cp.seed(&r, json!({"spec": {"selector": {"app": "web"}, "ports": [{"port": 80}]}}));
    let ip = seeded.pointer("/spec/clusterIP").cloned().unwrap();

    let out = rec.reconcile(&service(json!([{"port": 80}, {"port": 8081}])), &dl()).await.unwrap();
    assert_eq!(out.action, ReconcileAction::Updated);
    assert_eq!(out.state.pointer("/spec/clusterIP"), Some(&ip));
    assert_eq!(out.state.pointer("/spec/ports").and_then(|p| p.as_array()).map(|a| a.len()), Some(2));

    let again = rec.reconcile(&service(json!([{"port": 80}, {"port": 8081}])), &dl()).await.unwrap();
    assert_eq!(again.action, ReconcileAction::Unchanged);
}

#[tokio::test]
async fn external_annotations_survive_and_desired_wins_on_overlap() {
    let (cp, rec) = setup();
    let ing = |timeout: &str| ResourceDescriptor::new(
        ResourceKind::Ingress,
        Some("demo"),
        "web",
        json!({"metadata": {"annotations": {"proxy-read-timeout": timeout}}, "spec": {"rules": [{"host": "web.example.com"}]}}),
    ).unwrap();
    rec.reconcile(&ing("60"), &dl()).await.unwrap();
    let r = ing("60").reference;
    assert!(cp.modify_external(&r, |o| {
        o["metadata"]["annotations"]["cert-manager.io/issuer"] = json!("letsencrypt");
    }));

    let out = rec.reconcile(&ing("120"), &dl()).await.unwrap();
    assert_eq!(out.action, ReconcileAction::Updated);
    let ann = out.state.pointer("/metadata/annotations").unwrap();
    assert_eq!(ann["cert-manager.io/issuer"], "letsencrypt");
    assert_eq!(ann["proxy-read-timeout"], "120");
}

#[tokio::test]
async fn single_conflict_is_absorbed_by_refetch() {
    let (cp, rec) = setup();
    rec.reconcile(&workload(1), &dl()).await.unwrap();
    cp.inject(Fault::on(Verb::Update, KeelError::Conflict("modified".into())).kind(ResourceKind::Workload));
    cp.clear_calls();

    let out = rec.reconcile(&workload(2), &dl()).await.unwrap();
    assert_eq!(out.action, ReconcileAction::Updated);
    let verbs: Vec<Verb> = cp.calls().into_iter().map(|c| c.verb).collect();
    assert_eq!(verbs, vec![Verb::Get, Verb::Update, Verb::Get, Verb::Update]);
}

#[tokio::test]
async fn repeated_conflict_is_surfaced_as_retryable() {
    let (cp, rec) = setup();
    rec.reconcile(&workload(1), &dl()).await.unwrap();
    cp.inject(Fault::on(Verb::Update, KeelError::Conflict("modified".into())).times(2));

    let e = rec.reconcile(&workload(2), &dl()).await.unwrap_err();
    assert!(matches!(e, KeelError::Conflict(_)), "{:?}", e);
    assert!(e.is_retryable());
}

#[tokio::test]
async fn create_conflict_refetches_before_retrying() {
    let (cp, rec) = setup();
    cp.inject(Fault::on(Verb::Create, KeelError::Conflict("already exists".into())));
    let out = rec.reconcile(&workload(1), &dl()).await.unwrap();
    assert_eq!(out.action, ReconcileAction::Created);
    let verbs: Vec<Verb> = cp.calls().into_iter().map(|c| c.verb).collect();
    assert_eq!(verbs, vec![Verb::Get, Verb::Create, Verb::Get, Verb::Create]);
}

#[tokio::test]
async fn unavailable_is_retried_with_backoff() {
    let (cp, rec) = setup();
    cp.inject(Fault::on(Verb::Get, KeelError::Unavailable("connection refused".into())).times(3));
    let out = rec.reconcile(&workload(1), &dl()).await.unwrap();
    assert_eq!(out.action, ReconcileAction::Created);
    assert_eq!(cp.calls().iter().filter(|c| c.verb == Verb::Get).count(), 4);
}

#[tokio::test]
async fn persistent_unavailability_ends_at_deadline() {
    let (cp, rec) = setup();
    cp.inject(Fault::on(Verb::Get, KeelError::Unavailable("connection refused".into())).always());
    let started = std::time::Instant::now();
    let e = rec.reconcile(&workload(1), &Deadline::after(Duration::from_millis(150))).await.unwrap_err();
    assert!(matches!(e, KeelError::Timeout(_)), "{:?}", e);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn validation_error_is_terminal() {
    let (cp, rec) = setup();
    cp.inject(Fault::on(Verb::Create, KeelError::Validation("spec.template: required".into())).always());
    let e = rec.reconcile(&workload(1), &dl()).await.unwrap_err();
    assert!(matches!(e, KeelError::Validation(_)));
    assert!(!e.is_retryable());
    assert_eq!(cp.mutations().len(), 1);
}

#[tokio::test]
async fn secret_string_data_converges() {
    let (cp, rec) = setup();
    let secret = ResourceDescriptor::new(
        ResourceKind::Secret,
        Some("demo"),
        "token",
        json!({"type": "Opaque", "stringData": {"API_KEY": "s3cret"}}),
    ).unwrap();
    let first = rec.reconcile(&secret, &dl()).await.unwrap();
    assert_eq!(first.action, ReconcileAction::Created);
    assert_eq!(first.state.pointer("/data/API_KEY"), Some(&json!("czNjcmV0")));
    assert!(first.state.get("stringData").is_none());
    cp.clear_calls();

    let again = rec.reconcile(&secret, &dl()).await.unwrap();
    assert_eq!(again.action, ReconcileAction::Unchanged);
    assert!(cp.mutations().is_empty());
}

#[tokio::test]
async fn cancelled_deadline_stops_before_any_call() {
    let (cp, rec) = setup();
    let d = dl();
    d.cancel();
    let e = rec.reconcile(&workload(1), &d).await.unwrap_err();
    assert!(matches!(e, KeelError::Timeout(_)));
    assert!(cp.calls().is_empty());
}

#[tokio::test]
async fn route_keeps_live_host_over_desired() {
    let (cp, rec) = setup();
    let r = ResourceRef::namespaced(ResourceKind::Route, "demo", "chat");
    cp.seed(&r, json!({"spec": {"host": "chat-demo.apps.local", "to": {"kind": "Service", "name": "web"}}}));
    let desc = ResourceDescriptor::new(
        ResourceKind::Route,
        Some("demo"),
        "chat",
        json!({"spec": {"host": "other.example.com", "to": {"kind": "Service", "name": "web"}, "port": {"targetPort": 8080}}}),
    ).unwrap();

    let out = rec.reconcile(&desc, &dl()).await.unwrap();
    assert_eq!(out.action, ReconcileAction::Updated);
    assert_eq!(out.state.pointer("/spec/host"), Some(&json!("chat-demo.apps.local")));
    assert_eq!(out.state.pointer("/spec/port/targetPort"), Some(&json!(8080)));

    cp.clear_calls();
    let again = rec.reconcile(&desc, &dl()).await.unwrap();
    assert_eq!(again.action, ReconcileAction::Unchanged);
    assert!(cp.mutations().is_empty(), "{:?}", cp.mutations());
}

#[tokio::test]
async fn bound_claim_keeps_volume_fields() {
    let (cp, rec) = setup();
    let claim = |size: &str| ResourceDescriptor::new(
        ResourceKind::PersistentVolumeClaim,
        Some("demo"),
        "models",
        json!({"spec": {"accessModes": ["ReadWriteOnce"], "resources": {"requests": {"storage": size}}}}),
    ).unwrap();
    rec.reconcile(&claim("1Gi"), &dl()).await.unwrap();
    let r = claim("1Gi").reference;
    assert!(cp.modify_external(&r, |obj| {
        obj["spec"]["volumeName"] = json!("pvc-0001");
        obj["spec"]["storageClassName"] = json!("standard");
        obj["spec"]["volumeMode"] = json!("Filesystem");
    }));

    let out = rec.reconcile(&claim("2Gi"), &dl()).await.unwrap();
    assert_eq!(out.action, ReconcileAction::Updated);
    assert_eq!(out.state.pointer("/spec/volumeName"), Some(&json!("pvc-0001")));
    assert_eq!(out.state.pointer("/spec/storageClassName"), Some(&json!("standard")));
    assert_eq!(out.state.pointer("/spec/volumeMode"), Some(&json!("Filesystem")));
    assert_eq!(out.state.pointer("/spec/resources/requests/storage"), Some(&json!("2Gi")));

    cp.clear_calls();
    let again = rec.reconcile(&claim("2Gi"), &dl()).await.unwrap();
    assert_eq!(again.action, ReconcileAction::Unchanged);
    assert!(cp.mutations().is_empty(), "{:?}", cp.mutations());
}

#[tokio::test]
async fn secret_type_is_kept_from_live() {
    let (cp, rec) = setup();
    let r = ResourceRef::namespaced(ResourceKind::Secret, "demo", "tls");
    cp.seed(&r, json!({"type": "kubernetes.io/tls", "data": {"tls.crt": "YQ==", "tls.key": "Yg=="}}));
    let desc = ResourceDescriptor::new(
        ResourceKind::Secret,
        Some("demo"),
        "tls",
        json!({"type": "Opaque", "data": {"tls.crt": "Yw==", "tls.key": "Yg=="}}),
    ).unwrap();

    let out = rec.reconcile(&desc, &dl()).await.unwrap();
    assert_eq!(out.action, ReconcileAction::Updated);
    assert_eq!(out.state.pointer("/type"), Some(&json!("kubernetes.io/tls")));
    assert_eq!(out.state.pointer("/data/tls.crt"), Some(&json!("Yw==")));

    cp.clear_calls();
    let again = rec.reconcile(&desc, &dl()).await.unwrap();
    assert_eq!(again.action, ReconcileAction::Unchanged);
    assert!(cp.mutations().is_empty(), "{:?}", cp.mutations());
}

#[tokio::test]
async fn failure_reports_last_live_version() {
    let (cp, rec) = setup();
    let created = rec.reconcile(&workload(1), &dl()).await.unwrap();
    let rv = created.state.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).unwrap().to_string();
    cp.inject(Fault::on(Verb::Update, KeelError::Validation("spec.replicas: must be >= 0".into())));

    let f = rec.reconcile_traced(&workload(-1), &dl()).await.unwrap_err();
    assert!(matches!(f.error, KeelError::Validation(_)));
    assert_eq!(f.last_observed.as_deref(), Some(format!("live resourceVersion {}", rv).as_str()));
}

#[tokio::test]
async fn timeout_reports_last_transient_error() {
    let (cp, rec) = setup();
    cp.inject(Fault::on(Verb::Get, KeelError::Unavailable("connection refused".into())).always());
    let f = rec.reconcile_traced(&workload(1), &Deadline::after(Duration::from_millis(100))).await.unwrap_err();
    assert!(matches!(f.error, KeelError::Timeout(_)), "{:?}", f.error);
    assert_eq!(f.last_observed.as_deref(), Some("last error: connection refused"));
}
