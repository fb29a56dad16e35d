use async_trait::async_trait;
use axum::Router;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::config::GatewayConfig;
use crate::db::test_database;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::audit::{AuditEvent, AuditSink};
use crate::gateway::executor::{OutboundRequest, RemoteResponse, Transport};
use crate::gateway::Gateway;

/// Records every request and replays scripted outcomes. When the script is
/// exhausted it answers `200 {}`.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<GatewayResult<RemoteResponse>>>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, status: u16, headers: &[(&str, &str)], body: &str) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(RemoteResponse::from_parts(status, &map, body.as_bytes())));
    }

    pub fn push_error(&self, error: GatewayError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: OutboundRequest) -> GatewayResult<RemoteResponse> {
        self.requests.lock().unwrap().push(request);
        self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(RemoteResponse::from_parts(200, &HeaderMap::new(), b"{}"))
        })
    }
}

#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub gateway: Gateway,
    pub transport: Arc<MockTransport>,
    pub audit: Arc<RecordingAuditSink>,
}

pub async fn harness() -> Harness {
    let transport = Arc::new(MockTransport::new());
    let audit = Arc::new(RecordingAuditSink::default());
    let gateway = Gateway::new(
        test_database().await,
        transport.clone(),
        audit.clone(),
        GatewayConfig::default(),
    );
    Harness {
        gateway,
        transport,
        audit,
    }
}

/// Serves `router` on an ephemeral loopback port and returns its base URL.
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
