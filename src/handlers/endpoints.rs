use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::db::models::{CreateEndpoint, EndpointView, UpdateEndpoint};
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::executor::RemoteResponse;
use crate::gateway::{ConnectionTest, ExecuteRequest};
use crate::handlers::{Actor, AppState};

pub async fn list_endpoints(
    State(state): State<Arc<AppState>>,
) -> GatewayResult<Json<Vec<EndpointView>>> {
    Ok(Json(state.gateway.list_endpoints().await?))
}

pub async fn get_endpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> GatewayResult<Json<EndpointView>> {
    Ok(Json(state.gateway.get_endpoint(&id).await?))
}

pub async fn create_endpoint(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(input): Json<CreateEndpoint>,
) -> GatewayResult<(StatusCode, Json<EndpointView>)> {
    let view = state.gateway.create_endpoint(&actor, input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn update_endpoint(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(id): Path<String>,
    Json(update): Json<UpdateEndpoint>,
) -> GatewayResult<Json<EndpointView>> {
    Ok(Json(state.gateway.update_endpoint(&actor, &id, update).await?))
}

pub async fn delete_endpoint(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(id): Path<String>,
) -> GatewayResult<Json<Value>> {
    state.gateway.delete_endpoint(&actor, &id).await?;
    Ok(Json(json!({ "message": "Endpoint deleted" })))
}

/// Always answers 200 with a `success` flag unless the endpoint is unknown.
pub async fn test_endpoint(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(id): Path<String>,
) -> GatewayResult<Json<ConnectionTest>> {
    match state.gateway.test_connection(&actor, &id).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e @ GatewayError::NotFound(_)) => Err(e),
        Err(e) => {
            tracing::warn!("Connection test for endpoint {} failed: {}", id, e);
            Ok(Json(ConnectionTest::failed(e.to_string())))
        }
    }
}

pub async fn execute_endpoint(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> GatewayResult<Json<RemoteResponse>> {
    Ok(Json(state.gateway.execute_request(&actor, &id, request).await?))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::error::GatewayError;
    use crate::gateway::test_support::{harness, Harness};
    use crate::handlers::{router, AppState};

    async fn app() -> (Router, Harness) {
        let h = harness().await;
        let app = router(Arc::new(AppState {
            gateway: h.gateway.clone(),
        }));
        (app, h)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        actor: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(actor) = actor {
            builder = builder.header("x-actor-id", actor);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn device() -> Value {
        json!({
            "name": "door",
            "baseUrl": "http://10.0.0.5",
            "auth": {"type": "basic", "username": "svc", "password": "p@ss"},
            "allowedOperations": [{"name": "ping", "path": "/ping", "method": "GET"}]
        })
    }

    #[tokio::test]
    async fn crud_round_trip_never_exposes_secret() {
        let (app, _h) = app().await;

        let (status, created) =
            call(&app, "POST", "/api-endpoints", Some("admin"), Some(device())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["authType"], "basic");
        assert_eq!(created["hasSecret"], true);
        assert_eq!(created["status"], "active");
        assert_eq!(created["createdBy"], "admin");
        assert!(!created.to_string().contains("p@ss"));
        let id = created["id"].as_str().unwrap().to_string();

        let (status, list) = call(&app, "GET", "/api-endpoints", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, updated) = call(
            &app,
            "PUT",
            &format!("/api-endpoints/{}", id),
            Some("admin"),
            Some(json!({"description": "front door", "secret": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["description"], "front door");
        assert_eq!(updated["hasSecret"], true);

        let (status, deleted) = call(
            &app,
            "DELETE",
            &format!("/api-endpoints/{}", id),
            Some("admin"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["message"], "Endpoint deleted");

        let (status, body) = call(&app, "GET", &format!("/api-endpoints/{}", id), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn mutations_require_actor() {
        let (app, h) = app().await;
        let (status, body) = call(&app, "POST", "/api-endpoints", None, Some(device())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");
        assert!(h.gateway.list_endpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn incomplete_auth_is_configuration_error() {
        let (app, _h) = app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/api-endpoints",
            Some("admin"),
            Some(json!({
                "name": "cam",
                "baseUrl": "http://10.0.0.6",
                "auth": {"type": "digest", "password": "x"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "configuration");
    }

    #[tokio::test]
    async fn test_route_reports_failure_as_data() {
        let (app, h) = app().await;
        let (_, created) = call(&app, "POST", "/api-endpoints", Some("admin"), Some(device())).await;
        let id = created["id"].as_str().unwrap();

        h.transport
            .push_error(GatewayError::Transport("Request timed out after 10000 ms".to_string()));
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api-endpoints/{}/test", id),
            Some("admin"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Request timed out after 10000 ms");

        let (_, stored) = call(&app, "GET", &format!("/api-endpoints/{}", id), None, None).await;
        assert_eq!(stored["status"], "error");
        assert!(stored["lastTestedAt"].is_string());

        let (status, _) = call(
            &app,
            "POST",
            "/api-endpoints/missing/test",
            Some("admin"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn execute_route_returns_remote_response() {
        let (app, h) = app().await;
        let (_, created) = call(&app, "POST", "/api-endpoints", Some("admin"), Some(device())).await;
        let id = created["id"].as_str().unwrap();

        h.transport
            .push_response(503, &[("Content-Type", "application/json")], r#"{"busy":true}"#);
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api-endpoints/{}/execute", id),
            Some("user-1"),
            Some(json!({"path": "/ping", "method": "GET"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["statusCode"], 503);
        assert_eq!(body["body"]["busy"], true);
        assert_eq!(body["headers"]["content-type"], "application/json");

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api-endpoints/{}/execute", id),
            Some("user-1"),
            Some(json!({"path": "/factory-reset", "method": "POST"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn healthz_is_public() {
        let (app, _h) = app().await;
        let (status, body) = call(&app, "GET", "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
