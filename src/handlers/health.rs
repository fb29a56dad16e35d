use axum::Json;
use serde_json::{json, Value};

/// Liveness probe. Does not touch the database or any remote endpoint.
pub async fn healthz() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
