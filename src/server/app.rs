use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::HeaderValue, middleware, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::api::{self, ApiError, AppState, SharedState};
use super::ratelimit::{self, RateLimits};
use crate::config::Config;
use crate::llm;
use crate::orchestrator::Orchestrator;
use crate::phase::PhaseSpec;
use crate::store::{ArtifactFiles, DbHandle};

/// Where the HTTP listener binds.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// Open the database, load the phase spec and build the LLM client.
pub fn build_state(config: &Config) -> Result<SharedState> {
    let db = config
        .database
        .open()
        .with_context(|| format!("Failed to open database {}", config.database))?;
    let db = DbHandle::new(db);
    let spec = PhaseSpec::load_or_builtin(config.phase_spec_path())
        .context("Failed to load phase specification")?;
    let llm = llm::from_config(&config.llm).context("Failed to configure LLM client")?;
    let files = ArtifactFiles::new(&config.artifacts_dir);

    Ok(Arc::new(AppState {
        orchestrator: Orchestrator::new(db.clone(), files.clone(), llm, Arc::new(spec)),
        db,
        files,
        auth_secret: config.auth_secret.clone(),
        limits: RateLimits::per_minute(
            config.rate_limit_per_minute,
            config.execute_rate_limit_per_minute,
        ),
    }))
}

/// `/health` is served outside the rate limiter; everything under `/api`
/// passes through it before any handler or auth check runs.
pub fn build_router(state: SharedState) -> Router {
    let api = api::api_router().layer(middleware::from_fn_with_state(
        state.clone(),
        ratelimit::enforce,
    ));

    Router::new()
        .route("/health", get(api::health_check))
        .merge(api)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Route not found".into())
}

/// CORS for the browser app at `PUBLIC_APP_URL`.
pub fn cors_layer(public_app_url: &str) -> Result<CorsLayer> {
    let url = reqwest::Url::parse(public_app_url)
        .with_context(|| format!("Invalid PUBLIC_APP_URL '{}'", public_app_url))?;
    let origin = HeaderValue::from_str(&url.origin().ascii_serialization())
        .context("PUBLIC_APP_URL is not a valid origin")?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any))
}

pub async fn start_server(config: Config, server: ServerConfig) -> Result<()> {
    let state = build_state(&config)?;
    let app = build_router(state).layer(cors_layer(&config.public_app_url)?);

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        database = %config.database,
        artifacts = %config.artifacts_dir.display(),
        "specflow listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C; shutting down");
        return;
    }
    tracing::info!("Shutting down");
}
