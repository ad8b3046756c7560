//! HTTP transport collaborator used by request steps.

use crate::error::StepError;
use crate::eval::render;
use reqwest::blocking::Client;
use reqwest::redirect::Policy;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub const VALID_METHODS: [&str; 7] = ["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"];

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub trait Transport: Send + Sync {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub params: Vec<(String, String)>,
    pub json: Option<Value>,
    pub data: Option<Value>,
    pub cookies: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub verify: bool,
    pub allow_redirects: bool,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            params: Vec::new(),
            json: None,
            data: None,
            cookies: BTreeMap::new(),
            timeout: None,
            verify: true,
            allow_redirects: true,
        }
    }

    /// Builds a request from the remaining keys of an evaluated request payload.
    pub fn from_options(
        method: &str,
        url: &str,
        options: &Map<String, Value>,
        verify: bool,
    ) -> Result<Self, StepError> {
        let mut request = HttpRequest::new(method.to_uppercase(), url);
        request.verify = verify;

        for (key, value) in options {
            match key.as_str() {
                "headers" => request.headers = string_map(key, value)?,
                "cookies" => request.cookies = string_map(key, value)?,
                "params" => request.params = string_map(key, value)?.into_iter().collect(),
                "json" => request.json = Some(value.clone()),
                "data" => request.data = Some(value.clone()),
                "timeout" => {
                    let seconds = value.as_f64().ok_or_else(|| {
                        StepError::params(format!("timeout must be a number, got {value}"))
                    })?;
                    request.timeout = Some(Duration::from_secs_f64(seconds.max(0.0)));
                }
                "verify" => request.verify = value.as_bool().unwrap_or(verify),
                "allow_redirects" => request.allow_redirects = value.as_bool().unwrap_or(true),
                other => debug!("ignoring unsupported request option '{other}'"),
            }
        }

        Ok(request)
    }
}

fn string_map(key: &str, value: &Value) -> Result<BTreeMap<String, String>, StepError> {
    match value {
        Value::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), render(v))).collect()),
        Value::Null => Ok(BTreeMap::new()),
        other => Err(StepError::params(format!(
            "request {key} must be a mapping, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub reason: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub elapsed: Duration,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    /// Structured body, falling back to the raw text.
    pub fn body_value(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or_else(|_| Value::String(self.text()))
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ReqwestTransport {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TransportError::InvalidMethod(request.method.clone()))?;
        let redirect = if request.allow_redirects {
            Policy::limited(10)
        } else {
            Policy::none()
        };
        let client = Client::builder()
            .user_agent("steprunner")
            .timeout(request.timeout.unwrap_or(self.timeout))
            .danger_accept_invalid_certs(!request.verify)
            .redirect(redirect)
            .build()?;

        let mut builder = client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if !request.cookies.is_empty() {
            let cookie = request
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }
        if let Some(json) = &request.json {
            builder = builder.json(json);
        }
        match &request.data {
            Some(Value::Object(form)) => {
                let pairs: Vec<(String, String)> =
                    form.iter().map(|(k, v)| (k.clone(), render(v))).collect();
                builder = builder.form(&pairs);
            }
            Some(Value::String(raw)) => builder = builder.body(raw.clone()),
            Some(Value::Null) | None => {}
            Some(other) => builder = builder.body(other.to_string()),
        }

        let timer = Instant::now();
        let response = builder.send()?;

        let status = response.status();
        let url = response.url().to_string();
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).to_string();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
        let cookies = response
            .cookies()
            .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
            .collect();
        let body = response.bytes()?.to_vec();
        let elapsed = timer.elapsed();

        Ok(HttpResponse {
            status_code: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            url,
            headers,
            cookies,
            elapsed,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn default_timeout_is_30_seconds() {
        assert_eq!(ReqwestTransport::new().timeout(), Duration::from_secs(30));
    }

    #[test]
    fn builds_request_from_options() {
        let options = json!({
            "headers": {"X-Token": "abc", "X-Retry": 3},
            "params": {"page": 2},
            "json": {"name": "user"},
            "timeout": 2.5,
            "group": "ignored"
        });
        let request = HttpRequest::from_options(
            "post",
            "http://localhost/users",
            options.as_object().expect("object"),
            false,
        )
        .expect("valid options");

        assert_eq!(request.method, "POST");
        assert_eq!(request.headers.get("X-Retry").map(String::as_str), Some("3"));
        assert_eq!(request.params, vec![("page".to_string(), "2".to_string())]);
        assert_eq!(request.json, Some(json!({"name": "user"})));
        assert_eq!(request.timeout, Some(Duration::from_millis(2500)));
        assert!(!request.verify);
    }

    #[test]
    fn rejects_non_mapping_headers() {
        let options = json!({"headers": ["a"]});
        let err = HttpRequest::from_options("GET", "/", options.as_object().expect("object"), true)
            .expect_err("headers must be a mapping");
        assert!(matches!(err, StepError::Params(_)));
    }

    #[test]
    fn sends_request_and_captures_response() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/users/1000")
                .query_param("verbose", "1")
                .header("x-token", "abc");
            then.status(200)
                .header("content-type", "application/json")
                .header("set-cookie", "session=xyz; Path=/")
                .json_body(json!({"id": 1000, "name": "leo"}));
        });

        let mut request = HttpRequest::new("GET", server.url("/users/1000"));
        request.headers.insert("x-token".to_string(), "abc".to_string());
        request.params.push(("verbose".to_string(), "1".to_string()));

        let response = ReqwestTransport::new().request(&request).expect("response");

        mock.assert();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        assert_eq!(response.cookies.get("session").map(String::as_str), Some("xyz"));
        assert_eq!(response.body_value(), json!({"id": 1000, "name": "leo"}));
    }

    #[test]
    fn body_falls_back_to_text() {
        let response = HttpResponse {
            status_code: 200,
            reason: "OK".to_string(),
            url: "http://localhost/".to_string(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            elapsed: Duration::from_millis(5),
            body: b"plain body".to_vec(),
        };
        assert_eq!(response.body_value(), json!("plain body"));
    }
}
