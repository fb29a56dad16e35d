use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};

/// A fully decorated request, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Duration,
    pub verify_tls: bool,
}

impl OutboundRequest {
    /// Path and query as sent in the request line.
    pub fn request_uri(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(parsed) => match parsed.query() {
                Some(query) => format!("{}?{}", parsed.path(), query),
                None => parsed.path().to_string(),
            },
            Err(_) => self.url.clone(),
        }
    }
}

/// Whatever the remote side answered, including non-2xx statuses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

impl RemoteResponse {
    /// Header names are stored lower-cased; repeated headers are joined
    /// with ", ".
    pub fn from_parts(status_code: u16, headers: &HeaderMap, body: &[u8]) -> Self {
        let mut collected: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value.as_bytes()).to_string();
            collected
                .entry(name.as_str().to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        Self {
            status_code,
            headers: collected,
            body: parse_body(body),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

fn parse_body(body: &[u8]) -> serde_json::Value {
    if body.is_empty() {
        return serde_json::Value::Null;
    }
    match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => serde_json::Value::String(String::from_utf8_lossy(body).to_string()),
    }
}

/// Performs a single HTTP exchange. Implementations never retry and only
/// fail for transport-level problems.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> GatewayResult<RemoteResponse>;
}

pub struct ReqwestTransport {
    verified: Client,
    insecure: Client,
}

impl ReqwestTransport {
    pub fn new() -> GatewayResult<Self> {
        let verified = Client::builder()
            .build()
            .map_err(|e| GatewayError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        let insecure = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| GatewayError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { verified, insecure })
    }

    /// Certificate checks are skipped only when the profile opts out.
    fn client_for(&self, verify_tls: bool) -> &Client {
        if verify_tls {
            &self.verified
        } else {
            &self.insecure
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> GatewayResult<RemoteResponse> {
        let client = self.client_for(request.verify_tls);
        let timeout = request.timeout;

        let mut builder = client
            .request(request.method.clone(), &request.url)
            .headers(request.headers)
            .timeout(timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        tracing::debug!("{} {}", request.method, request.url);
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        Ok(RemoteResponse::from_parts(status, &headers, &body))
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Transport(format!(
            "Request timed out after {} ms",
            timeout.as_millis()
        ))
    } else if err.is_connect() {
        GatewayError::Transport(format!("Connection failed: {}", err))
    } else {
        GatewayError::Transport(format!("Request failed: {}", err))
    }
}
