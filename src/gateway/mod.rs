pub mod audit;
pub mod auth;
pub mod digest;
pub mod executor;
pub mod health;

#[cfg(test)]
pub(crate) mod test_support;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::db::models::{CreateEndpoint, EndpointProfile, EndpointStatus, EndpointView, UpdateEndpoint};
use crate::db::Database;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::audit::{AuditAction, AuditEvent, AuditSink};
use crate::gateway::auth::{AuthDispatcher, AuthScheme};
use crate::gateway::executor::{OutboundRequest, RemoteResponse, Transport};
use crate::gateway::health::{HealthRecorder, HealthReport};

/// Caller input for `execute_request`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ConnectionTest {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            status_code: None,
            data: None,
        }
    }
}

/// The credential and dispatch engine. Cheap to clone; every call is
/// independent and holds no lock across the network round-trip.
#[derive(Clone)]
pub struct Gateway {
    db: Database,
    transport: Arc<dyn Transport>,
    audit: Arc<dyn AuditSink>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        db: Database,
        transport: Arc<dyn Transport>,
        audit: Arc<dyn AuditSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            db,
            transport,
            audit,
            config,
        }
    }

    pub async fn create_endpoint(
        &self,
        actor: &str,
        input: CreateEndpoint,
    ) -> GatewayResult<EndpointView> {
        let profile = self.db.create_endpoint(input, actor).await?;
        let view = profile.view();
        self.audit
            .record(AuditEvent::new(actor, AuditAction::Create, &profile.id).after(&view));
        Ok(view)
    }

    pub async fn list_endpoints(&self) -> GatewayResult<Vec<EndpointView>> {
        let profiles = self.db.get_endpoints().await?;
        Ok(profiles.iter().map(EndpointProfile::view).collect())
    }

    pub async fn get_endpoint(&self, id: &str) -> GatewayResult<EndpointView> {
        Ok(self.db.find_endpoint(id).await?.view())
    }

    pub async fn update_endpoint(
        &self,
        actor: &str,
        id: &str,
        update: UpdateEndpoint,
    ) -> GatewayResult<EndpointView> {
        let before = self.db.find_endpoint(id).await?.view();
        let after = self.db.update_endpoint(id, update).await?.view();
        self.audit.record(
            AuditEvent::new(actor, AuditAction::Update, id)
                .before(&before)
                .after(&after),
        );
        Ok(after)
    }

    pub async fn delete_endpoint(&self, actor: &str, id: &str) -> GatewayResult<()> {
        let before = self.db.find_endpoint(id).await?.view();
        if !self.db.delete_endpoint(id).await? {
            return Err(GatewayError::NotFound(format!("Endpoint {} not found", id)));
        }
        self.audit
            .record(AuditEvent::new(actor, AuditAction::Delete, id).before(&before));
        Ok(())
    }

    /// Probes the first catalogued operation, or `GET /` when there is none.
    ///
    /// Transport and crypto failures are recorded as unhealthy before they
    /// are returned.
    pub async fn test_connection(&self, actor: &str, id: &str) -> GatewayResult<ConnectionTest> {
        let profile = self.db.find_endpoint(id).await?;
        let (method, path) = match profile.allowed_operations.first() {
            Some(op) => (parse_method(&op.method)?, op.path.clone()),
            None => (Method::GET, "/".to_string()),
        };

        let scheme = AuthScheme::from_profile(&profile, &self.config.default_api_key_header)?;
        let request = self.build_request(&profile, method.clone(), &path, None, &BTreeMap::new())?;

        tracing::info!("Testing endpoint {} ({} {})", profile.id, method, path);
        let result = self.dispatch_and_record(&profile, &scheme, request).await;

        let event = AuditEvent::new(actor, AuditAction::Test, id);
        match result {
            Ok((response, report)) => {
                let outcome = ConnectionTest {
                    success: report.is_healthy(),
                    message: report.summary,
                    status_code: Some(response.status_code),
                    data: Some(response.body),
                };
                self.audit.record(event.after(serde_json::json!({
                    "success": outcome.success,
                    "message": outcome.message,
                    "statusCode": outcome.status_code,
                })));
                Ok(outcome)
            }
            Err(e) => {
                self.audit.record(event.after(serde_json::json!({
                    "success": false,
                    "message": e.to_string(),
                })));
                Err(e)
            }
        }
    }

    /// Calls one catalogued operation. Remote non-2xx answers come back as
    /// data; only validation, lookup, configuration, crypto and transport
    /// problems are errors.
    pub async fn execute_request(
        &self,
        actor: &str,
        id: &str,
        request: ExecuteRequest,
    ) -> GatewayResult<RemoteResponse> {
        let profile = self.db.find_endpoint(id).await?;
        let method = parse_method(&request.method)?;

        if profile.find_operation(&request.path, method.as_str()).is_none() {
            return Err(GatewayError::NotFound(format!(
                "Operation {} {} is not configured for endpoint {}",
                method, request.path, profile.name
            )));
        }
        if profile.status == EndpointStatus::Inactive {
            return Err(GatewayError::Validation(format!(
                "Endpoint {} is inactive",
                profile.name
            )));
        }

        let scheme = AuthScheme::from_profile(&profile, &self.config.default_api_key_header)?;
        let outbound = self.build_request(
            &profile,
            method.clone(),
            &request.path,
            request.body.as_ref(),
            &request.headers,
        )?;

        tracing::info!(
            "Executing {} {} on endpoint {} ({})",
            method,
            request.path,
            profile.id,
            scheme.auth_type().as_str()
        );
        let result = self.dispatch_and_record(&profile, &scheme, outbound).await;

        let summary = match &result {
            Ok((response, report)) => serde_json::json!({
                "path": request.path,
                "method": method.as_str(),
                "statusCode": response.status_code,
                "result": report.summary,
            }),
            Err(e) => serde_json::json!({
                "path": request.path,
                "method": method.as_str(),
                "error": e.to_string(),
            }),
        };
        self.audit
            .record(AuditEvent::new(actor, AuditAction::Execute, id).after(summary));

        result.map(|(response, _)| response)
    }

    async fn dispatch_and_record(
        &self,
        profile: &EndpointProfile,
        scheme: &AuthScheme,
        request: OutboundRequest,
    ) -> GatewayResult<(RemoteResponse, HealthReport)> {
        let outcome = AuthDispatcher::new(self.db.cipher(), self.transport.as_ref())
            .dispatch(scheme, request)
            .await;

        match outcome {
            Err(e) if !e.is_call_failure() => Err(e),
            outcome => {
                let report = HealthRecorder::new(&self.db)
                    .record(&profile.id, &outcome)
                    .await;
                outcome.map(|response| (response, report))
            }
        }
    }

    /// Profile headers first, caller overrides next. Auth headers are added
    /// later by the dispatcher and win over both.
    fn build_request(
        &self,
        profile: &EndpointProfile,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        overrides: &BTreeMap<String, String>,
    ) -> GatewayResult<OutboundRequest> {
        let body = body.filter(|b| !b.is_null());

        let mut headers = HeaderMap::new();
        if body.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        for (name, value) in profile.custom_headers.iter().chain(overrides.iter()) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| GatewayError::Validation(format!("Invalid header name '{}'", name)))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                GatewayError::Validation(format!("Invalid value for header '{}'", name))
            })?;
            headers.insert(name, value);
        }

        let body = body
            .map(serde_json::to_vec)
            .transpose()?
            .map(Bytes::from);

        Ok(OutboundRequest {
            method,
            url: join_url(&profile.base_url, path),
            headers,
            body,
            timeout: self.config.effective_timeout(profile.timeout_ms),
            verify_tls: profile.verify_tls,
        })
    }
}

fn parse_method(method: &str) -> GatewayResult<Method> {
    Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| GatewayError::Validation(format!("Invalid HTTP method '{}'", method)))
}

fn join_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}
