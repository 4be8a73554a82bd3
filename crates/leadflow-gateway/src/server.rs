//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use leadflow_core::config::GatewayConfig;
use leadflow_router::IntakeHandler;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    /// Signup pipeline: guard, classifier, router, scheduler.
    pub intake: Arc<IntakeHandler>,
    /// When set, POST webhooks must carry a valid `X-Webhook-Signature`.
    pub webhook_secret: Option<String>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        gateway_config: GatewayConfig,
        intake: Arc<IntakeHandler>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            gateway_config,
            intake,
            webhook_secret: webhook_secret.filter(|s| !s.trim().is_empty()),
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    let cors = {
        let cors = CorsLayer::new()
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers(Any)
            .max_age(std::time::Duration::from_secs(3600));

        let origins: Vec<_> = shared
            .gateway_config
            .cors_origins
            .iter()
            .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
            .collect();
        if origins.is_empty() {
            cors.allow_origin(Any)
        } else {
            cors.allow_origin(origins)
        }
    };

    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/webhook/signup", post(super::routes::signup))
        .route("/api/v1/signup", post(super::routes::signup))
        .route("/webhook/unsubscribe", post(super::routes::unsubscribe))
        .route("/api/v1/sequences/{email}", get(super::routes::get_sequence))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Bind and serve until the process exits.
pub async fn start(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.gateway_config.host, state.gateway_config.port);
    let signed = state.webhook_secret.is_some();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        "🌐 Gateway listening on http://{addr} (signature check: {})",
        if signed { "on" } else { "off" }
    );

    axum::serve(listener, app).await?;
    Ok(())
}
