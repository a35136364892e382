use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderValue},
    routing::get,
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    registry::RegistryReader,
    scheduler::{CycleCounters, CycleStats},
    summary::{summarize, Summary},
};

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryReader,
    pub counters: Arc<CycleCounters>,
}

/// Read-only JSON API over the registry.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/summary", get(get_summary))
        .route("/health", get(get_health))
        .with_state(state);

    Router::new().nest("/api", api).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(SetResponseHeaderLayer::overriding(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-store"),
            )),
    )
}

/// Serve the API on `bind` until `cancel` fires.
pub async fn serve(bind: &str, state: AppState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("serving API on http://{}/api/summary", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("HTTP server error")?;
    Ok(())
}

async fn get_summary(State(app): State<AppState>) -> Json<Summary> {
    let snapshot = app.registry.snapshot().await;
    Json(summarize(&snapshot))
}

async fn get_health(State(app): State<AppState>) -> Json<CycleStats> {
    Json(app.counters.stats())
}
