pub mod endpoints;
pub mod health;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::gateway::Gateway;

pub const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route(
            "/api-endpoints",
            get(endpoints::list_endpoints).post(endpoints::create_endpoint),
        )
        .route(
            "/api-endpoints/{id}",
            get(endpoints::get_endpoint)
                .put(endpoints::update_endpoint)
                .delete(endpoints::delete_endpoint),
        )
        .route("/api-endpoints/{id}/test", post(endpoints::test_endpoint))
        .route("/api-endpoints/{id}/execute", post(endpoints::execute_endpoint))
        .with_state(state)
}

/// Identity of the caller, taken from the `X-Actor-Id` header. Required on
/// every route that changes a profile or reaches a remote endpoint.
#[derive(Debug, Clone)]
pub struct Actor(pub String);

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Actor(v.to_string()))
            .ok_or_else(|| GatewayError::Validation("Missing X-Actor-Id header".to_string()))
    }
}
