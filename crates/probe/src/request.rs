use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Get,
    Post,
}

/// What a 2xx body must look like to count as a pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "shape", content = "at", rename_all = "snake_case")]
pub enum ResponseShape {
    /// Any body, including an empty one.
    #[default]
    Any,
    /// Body parses as JSON.
    Json,
    /// JSON with a non-null value at every pointer.
    JsonFields(Vec<String>),
    /// JSON with a non-empty array at the pointer.
    NonEmptyArray(String),
}

/// One synthetic call against the deployed application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Json>,
    pub headers: Vec<(String, String)>,
    pub expect: ResponseShape,
}

impl ProbeRequest {
    pub fn get(path: &str) -> Self {
        Self { method: Method::Get, path: path.to_string(), body: None, headers: Vec::new(), expect: ResponseShape::Any }
    }

    pub fn post(path: &str, body: Json) -> Self {
        Self { method: Method::Post, path: path.to_string(), body: Some(body), headers: Vec::new(), expect: ResponseShape::Json }
    }

    /// OpenAI-style chat completion; passes when `choices` is non-empty.
    pub fn chat_completion(model: &str, system_prompt: &str, message: &str) -> Self {
        let body = json!({
            "model": model,
            "stream": false,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": message},
            ],
        });
        Self::post("/v1/chat/completions", body).expect(ResponseShape::NonEmptyArray("/choices".into()))
    }

    /// Simple `POST /chat {"prompt": ...}` echo call.
    pub fn chat(prompt: &str) -> Self {
        Self::post("/chat", json!({"prompt": prompt}))
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn expect(mut self, shape: ResponseShape) -> Self {
        self.expect = shape;
        self
    }
}

/// Externally reachable base address of the application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    /// Skip certificate validation. Off unless explicitly requested.
    #[serde(default)]
    pub insecure_tls: bool,
}

impl Endpoint {
    pub fn new(base_url: &str) -> Self { Self { base_url: base_url.to_string(), insecure_tls: false } }

    pub fn insecure(mut self, on: bool) -> Self {
        self.insecure_tls = on;
        self
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.is_empty() { return self.base_url.clone(); }
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProbePolicy {
    /// Total tries, counting the first one.
    pub max_attempts: u32,
    pub backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff: Duration::from_millis(500), request_timeout: Duration::from_secs(30) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_join_handles_slashes() {
        let e = Endpoint::new("http://chat.demo.apps.local/");
        assert_eq!(e.url_for("/v1/chat/completions"), "http://chat.demo.apps.local/v1/chat/completions");
        assert_eq!(Endpoint::new("http://h").url_for("healthz"), "http://h/healthz");
        assert_eq!(Endpoint::new("http://h/").url_for(""), "http://h/");
    }

    #[test]
    fn tls_validation_is_on_by_default() {
        assert!(!Endpoint::new("https://h").insecure_tls);
        let e: Endpoint = serde_json::from_value(json!({"base_url": "https://h"})).unwrap();
        assert!(!e.insecure_tls);
    }

    #[test]
    fn chat_completion_expects_choices() {
        let r = ProbeRequest::chat_completion("granite", "be brief", "hi");
        assert_eq!(r.method, Method::Post);
        assert_eq!(r.expect, ResponseShape::NonEmptyArray("/choices".into()));
        assert_eq!(r.body.as_ref().unwrap()["messages"][1]["content"], "hi");
    }
}
