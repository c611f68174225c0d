use std::error::Error as _;
use std::io;
use std::time::{Duration, Instant};

use keel_core::{Deadline, KeelError, KeelResult};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::request::{Endpoint, Method, ProbePolicy, ProbeRequest, ResponseShape};

/// Bodies kept in a result are cut at this size.
const MAX_PAYLOAD: usize = 64 * 1024;
/// Reading stops once a response body grows past this.
const MAX_BODY: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    /// Connection refused, reset or aborted.
    Connect,
    /// Any other transport failure (TLS, DNS, protocol).
    Transport,
    Timeout,
    /// Non-2xx response.
    Status,
    /// 2xx response whose body is not the expected shape.
    Payload,
    InvalidRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    pub success: bool,
    pub url: String,
    pub status: Option<u16>,
    pub error_kind: Option<ProbeErrorKind>,
    pub message: Option<String>,
    /// Raw response body, kept for diagnostics.
    pub payload: Option<String>,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl VerificationResult {
    /// Promote a failed result to `KeelError::Verification`.
    pub fn into_result(self) -> KeelResult<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(KeelError::Verification(self.describe()))
        }
    }

    pub fn describe(&self) -> String {
        let mut out = match (self.status, &self.message) {
            (Some(code), Some(m)) => format!("{} returned {}: {}", self.url, code, m),
            (Some(code), None) => format!("{} returned {}", self.url, code),
            (None, Some(m)) => format!("{}: {}", self.url, m),
            (None, None) => self.url.clone(),
        };
        if self.attempts > 1 {
            out.push_str(&format!(" after {} attempts", self.attempts));
        }
        if !self.success {
            if let Some(p) = self.payload.as_deref().filter(|p| !p.is_empty()) {
                let snippet: String = p.chars().take(200).collect();
                out.push_str(&format!("; body: {}", snippet));
            }
        }
        out
    }
}

enum Outcome {
    Response { status: u16, body: String, overflow: bool },
    Failed { kind: ProbeErrorKind, message: String },
}

/// Issues verification calls with bounded transport-level retries.
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    policy: ProbePolicy,
}

impl Verifier {
    pub fn new(policy: ProbePolicy) -> Self { Self { policy } }

    pub fn policy(&self) -> &ProbePolicy { &self.policy }

    pub async fn verify(&self, endpoint: &Endpoint, req: &ProbeRequest, deadline: &Deadline) -> VerificationResult {
        let t0 = Instant::now();
        let url = endpoint.url_for(&req.path);
        let mut result = VerificationResult {
            success: false,
            url: url.clone(),
            status: None,
            error_kind: None,
            message: None,
            payload: None,
            attempts: 0,
            elapsed_ms: 0,
        };
        let client = match build_client(endpoint) {
            Ok(c) => c,
            Err(e) => {
                result.error_kind = Some(ProbeErrorKind::InvalidRequest);
                result.message = Some(format!("building http client: {}", e));
                return finish(result, t0);
            }
        };

        let max = self.policy.max_attempts.max(1);
        loop {
            result.attempts += 1;
            counter!("probe_attempts", 1u64);
            let budget = self.policy.request_timeout.min(deadline.remaining());
            if budget.is_zero() {
                result.error_kind = Some(ProbeErrorKind::Timeout);
                result.message = Some(deadline.timeout_error("verification").to_string());
                return finish(result, t0);
            }
            debug!(%url, attempt = result.attempts, "probe request");
            let outcome = tokio::select! {
                o = send(&client, &url, req, budget) => o,
                _ = deadline.expired() => Outcome::Failed {
                    kind: ProbeErrorKind::Timeout,
                    message: deadline.timeout_error("verification").to_string(),
                },
            };
            match outcome {
                Outcome::Response { status, body, overflow } => {
                    result.status = Some(status);
                    let checks_body = !matches!(req.expect, ResponseShape::Any) && (200..300).contains(&status);
                    let verdict = if overflow && checks_body {
                        Err((ProbeErrorKind::Payload, format!("response body exceeds {} bytes", MAX_BODY)))
                    } else {
                        classify(status, &body, &req.expect)
                    };
                    match verdict {
                        Ok(()) => {
                            result.success = true;
                        }
                        Err((kind, msg)) => {
                            result.error_kind = Some(kind);
                            result.message = Some(msg);
                        }
                    }
                    result.payload = Some(truncate(body));
                    return finish(result, t0);
                }
                Outcome::Failed { kind: ProbeErrorKind::Connect, message } if result.attempts < max => {
                    warn!(%url, attempt = result.attempts, "probe connection failed: {}", message);
                    if !deadline.sleep(self.policy.backoff).await {
                        result.error_kind = Some(ProbeErrorKind::Connect);
                        result.message = Some(format!("{}; deadline reached before retry", message));
                        return finish(result, t0);
                    }
                }
                Outcome::Failed { kind, message } => {
                    result.error_kind = Some(kind);
                    result.message = Some(message);
                    return finish(result, t0);
                }
            }
        }
    }
}

fn finish(mut r: VerificationResult, t0: Instant) -> VerificationResult {
    r.elapsed_ms = t0.elapsed().as_millis() as u64;
    histogram!("probe_latency_ms", r.elapsed_ms as f64);
    if r.success {
        counter!("probe_ok", 1u64);
        info!(url = %r.url, status = ?r.status, attempts = r.attempts, "verification passed");
    } else {
        counter!("probe_failed", 1u64);
        warn!(url = %r.url, status = ?r.status, kind = ?r.error_kind, attempts = r.attempts, "verification failed");
    }
    r
}

fn build_client(endpoint: &Endpoint) -> reqwest::Result<reqwest::Client> {
    let mut b = reqwest::Client::builder().user_agent(concat!("keel/", env!("CARGO_PKG_VERSION")));
    if endpoint.insecure_tls {
        warn!(base_url = %endpoint.base_url, "TLS certificate validation disabled for verification");
        b = b.danger_accept_invalid_certs(true);
    }
    b.build()
}

async fn send(client: &reqwest::Client, url: &str, req: &ProbeRequest, timeout: Duration) -> Outcome {
    let mut rb = match req.method {
        Method::Get => client.get(url),
        Method::Post => client.post(url),
    };
    rb = rb.timeout(timeout);
    for (k, v) in &req.headers {
        rb = rb.header(k.as_str(), v.as_str());
    }
    if let Some(body) = &req.body {
        rb = rb.json(body);
    }
    let resp = match rb.send().await {
        Ok(r) => r,
        Err(e) => return transport_failure(e),
    };
    let status = resp.status().as_u16();
    match read_capped(resp).await {
        Ok((body, overflow)) => Outcome::Response { status, body, overflow },
        Err(e) => transport_failure(e),
    }
}

async fn read_capped(mut resp: reqwest::Response) -> reqwest::Result<(String, bool)> {
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = MAX_BODY - buf.len();
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            return Ok((String::from_utf8_lossy(&buf).into_owned(), true));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok((String::from_utf8_lossy(&buf).into_owned(), false))
}

fn transport_failure(e: reqwest::Error) -> Outcome {
    let kind = if e.is_timeout() {
        ProbeErrorKind::Timeout
    } else if e.is_builder() {
        ProbeErrorKind::InvalidRequest
    } else if is_reset(&e) {
        ProbeErrorKind::Connect
    } else {
        ProbeErrorKind::Transport
    };
    Outcome::Failed { kind, message: error_chain(&e) }
}

fn is_reset(e: &reqwest::Error) -> bool {
    let mut src = e.source();
    while let Some(s) = src {
        if let Some(io) = s.downcast_ref::<io::Error>() {
            if matches!(io.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted) {
                return true;
            }
        }
        src = s.source();
    }
    false
}

fn error_chain(e: &reqwest::Error) -> String {
    let mut out = e.to_string();
    let mut src = e.source();
    while let Some(s) = src {
        out.push_str(": ");
        out.push_str(&s.to_string());
        src = s.source();
    }
    out
}

/// Decide pass/fail for a received response.
pub(crate) fn classify(status: u16, body: &str, shape: &ResponseShape) -> Result<(), (ProbeErrorKind, String)> {
    if !(200..300).contains(&status) {
        return Err((ProbeErrorKind::Status, format!("non-2xx status {}", status)));
    }
    let parse = || serde_json::from_str::<Json>(body)
        .map_err(|e| (ProbeErrorKind::Payload, format!("response is not JSON: {}", e)));
    match shape {
        ResponseShape::Any => Ok(()),
        ResponseShape::Json => parse().map(|_| ()),
        ResponseShape::JsonFields(ptrs) => {
            let v = parse()?;
            match ptrs.iter().find(|p| v.pointer(p).map(|x| x.is_null()).unwrap_or(true)) {
                Some(p) => Err((ProbeErrorKind::Payload, format!("response missing field {}", p))),
                None => Ok(()),
            }
        }
        ResponseShape::NonEmptyArray(ptr) => {
            let v = parse()?;
            match v.pointer(ptr).and_then(|x| x.as_array()) {
                Some(a) if !a.is_empty() => Ok(()),
                Some(_) => Err((ProbeErrorKind::Payload, format!("{} is empty", ptr))),
                None => Err((ProbeErrorKind::Payload, format!("response has no array at {}", ptr))),
            }
        }
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_PAYLOAD {
        let mut cut = MAX_PAYLOAD;
        while !body.is_char_boundary(cut) { cut -= 1; }
        body.truncate(cut);
        body.push_str("...[truncated]");
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_and_shapes() {
        assert!(classify(200, "", &ResponseShape::Any).is_ok());
        assert_eq!(classify(503, "{}", &ResponseShape::Any).unwrap_err().0, ProbeErrorKind::Status);
        assert_eq!(classify(200, "<html>", &ResponseShape::Json).unwrap_err().0, ProbeErrorKind::Payload);
        assert!(classify(201, r#"{"model":"m","output":"hi"}"#, &ResponseShape::JsonFields(vec!["/model".into(), "/output".into()])).is_ok());
        let e = classify(200, r#"{"model":"m","output":null}"#, &ResponseShape::JsonFields(vec!["/output".into()])).unwrap_err();
        assert!(e.1.contains("/output"), "{}", e.1);
        assert!(classify(200, r#"{"choices":[{}]}"#, &ResponseShape::NonEmptyArray("/choices".into())).is_ok());
        let e = classify(200, r#"{"choices":[]}"#, &ResponseShape::NonEmptyArray("/choices".into())).unwrap_err();
        assert!(e.1.contains("empty"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(MAX_PAYLOAD);
        let t = truncate(s);
        assert!(t.ends_with("...[truncated]"));
        assert!(t.len() <= MAX_PAYLOAD + 20);
        assert_eq!(truncate("short".into()), "short");
    }

    #[test]
    fn failed_result_becomes_verification_error() {
        let r = VerificationResult {
            success: false,
            url: "http://h/chat".into(),
            status: Some(500),
            error_kind: Some(ProbeErrorKind::Status),
            message: Some("non-2xx status 500".into()),
            payload: Some("boom".into()),
            attempts: 1,
            elapsed_ms: 3,
        };
        let e = r.into_result().unwrap_err();
        assert!(matches!(e, KeelError::Verification(_)));
        let s = e.to_string();
        assert!(s.contains("500") && s.contains("boom"), "{}", s);
    }
}
