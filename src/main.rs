mod config;
mod crypto;
mod db;
mod error;
mod gateway;
mod handlers;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::crypto::SecretCipher;
use crate::gateway::audit::TracingAuditSink;
use crate::gateway::executor::ReqwestTransport;
use crate::gateway::Gateway;

#[derive(Parser, Debug)]
#[command(name = "api-gateway")]
#[command(about = "Credential store and dispatch gateway for remote HTTP endpoints", long_about = None)]
struct Args {
    /// Host for HTTP server
    #[arg(long, env = "GATEWAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port for HTTP server
    #[arg(short, long, env = "GATEWAY_PORT", default_value = "8080")]
    port: u16,

    /// Base path when running behind reverse proxy (e.g. /gateway)
    #[arg(long, env = "GATEWAY_BASE_PATH", default_value = "/")]
    base_path: String,

    /// Directory holding the database, KDF salt and generated master key
    #[arg(long, env = "GATEWAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Secret the credential encryption key is derived from
    #[arg(long, env = "GATEWAY_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    /// Timeout for remote calls when a profile does not set one
    #[arg(long, env = "GATEWAY_DEFAULT_TIMEOUT_MS", default_value_t = config::DEFAULT_TIMEOUT_MS)]
    default_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let app_dir = config::get_app_dir(args.data_dir.as_deref())?;
    config::init_directories(&app_dir)?;

    let cipher_config = config::load_cipher_config(&app_dir, args.encryption_key)?;
    let cipher = tokio::task::spawn_blocking(move || SecretCipher::from_config(&cipher_config))
        .await
        .context("Key derivation task panicked")??;

    let db = db::Database::open(&config::get_db_path(&app_dir), Arc::new(cipher)).await?;
    let transport = ReqwestTransport::new()?;
    let gateway = Gateway::new(
        db,
        Arc::new(transport),
        Arc::new(TracingAuditSink),
        GatewayConfig::default().with_default_timeout_ms(args.default_timeout_ms),
    );

    let base_path = normalize_base_path(&args.base_path);
    let router = handlers::router(Arc::new(handlers::AppState { gateway }));
    let app = if base_path == "/" {
        router
    } else {
        Router::new().nest(&base_path, router)
    };

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}{}", addr, base_path);

    axum::serve(listener, app).await?;

    Ok(())
}

fn normalize_base_path(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return "/".to_string();
    }
    let mut path = trimmed.to_string();
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    while path.ends_with('/') {
        path.pop();
    }
    path
}
