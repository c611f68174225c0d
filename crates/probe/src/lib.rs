//! Keel probe: one functional call against the deployed application to
//! prove it answers, not just that its pods are up.

#![forbid(unsafe_code)]

use keel_core::{KeelError, KeelResult, ResourceKind};
use serde_json::Value as Json;

mod request;
mod verifier;

pub use request::{Endpoint, Method, ProbePolicy, ProbeRequest, ResponseShape};
pub use verifier::{ProbeErrorKind, VerificationResult, Verifier};

/// Derive the public endpoint from a live Ingress or Route.
pub fn endpoint_from_exposure(state: &Json) -> KeelResult<Endpoint> {
    let api_version = state.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
    let kind_s = state.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    let name = state.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or("?");
    let (host, tls) = match ResourceKind::from_api_version_kind(api_version, kind_s) {
        Some(ResourceKind::Ingress) => (
            state.pointer("/spec/rules/0/host").and_then(|v| v.as_str()),
            state.pointer("/spec/tls").and_then(|v| v.as_array()).map(|a| !a.is_empty()).unwrap_or(false),
        ),
        Some(ResourceKind::Route) => (
            state.pointer("/spec/host").and_then(|v| v.as_str()),
            state.pointer("/spec/tls").map(|v| v.is_object()).unwrap_or(false),
        ),
        _ => return Err(KeelError::Validation(format!("{} {} is not an exposure object", kind_s, name))),
    };
    let host = host.filter(|h| !h.is_empty())
        .ok_or_else(|| KeelError::Validation(format!("{} {} has no host", kind_s, name)))?;
    let scheme = if tls { "https" } else { "http" };
    Ok(Endpoint::new(&format!("{}://{}", scheme, host)))
}
