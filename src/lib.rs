pub mod api;
pub mod bandwidth;
pub mod config;
pub mod control;
pub mod directory;
pub mod error;
pub mod health;
pub mod models;
pub mod relay;
pub mod session;
pub mod state;
pub mod supervisor;

use anyhow::Context;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use config::Config;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use supervisor::SupervisorState;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

/// Build the full router: stream endpoint, control API (directory push),
/// and admin API.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // Stream endpoint
        .route("/stream/{channel_id}", get(relay::stream_channel))
        // Control API (directory push from the admin store)
        .route("/control/v1/channels/{channel_id}", put(control::put_channel))
        .route(
            "/control/v1/channels/{channel_id}",
            delete(control::delete_channel),
        )
        .route("/control/v1/sync", post(control::sync))
        // Admin API
        .route("/admin/proxy/status", get(api::proxy_status))
        .route("/admin/proxy/start", post(api::proxy_start))
        .route("/admin/proxy/stop", post(api::proxy_stop))
        .route("/admin/proxy/connection-stats", get(api::connection_stats))
        .route("/admin/proxy/bandwidth-stats", get(api::bandwidth_stats))
        .route("/admin/channels/check/{channel_id}", get(api::check_channel))
        .route("/admin/channels/check-multiple", post(api::check_multiple))
        .route("/admin/channels/check-all", post(api::check_all))
        .route(
            "/admin/channels/check-progress/{token}",
            get(api::check_progress),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the router on an already-bound listener until a graceful
/// termination request arrives, then drain and exit.
///
/// Session teardown runs inside the shutdown future, not after serve
/// returns: relay bodies are unbounded streams that only end once their
/// session stops, and axum's in-flight wait would otherwise never finish
/// while a viewer is connected.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown_rx: mpsc::Receiver<()>,
) -> anyhow::Result<()> {
    let app = app(state.clone());
    state.set_lifecycle_state(SupervisorState::Running);

    let teardown = state.clone();
    let shutdown = async move {
        supervisor::shutdown_signal(shutdown_rx).await;
        teardown.set_lifecycle_state(SupervisorState::Stopping);
        tracing::info!("Stopping upstream sessions");
        teardown.sessions.stop_all();
        if !teardown
            .sessions
            .wait_drained(teardown.config.drain_grace)
            .await
        {
            tracing::warn!(
                "Sessions did not drain within {:?}, exiting anyway",
                teardown.config.drain_grace
            );
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error")?;

    state.set_lifecycle_state(SupervisorState::Stopped);
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Run the relay server on the configured address. Binding failures are
/// fatal and surface to the caller.
pub async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    let (state, shutdown_rx) = AppState::new(config.clone());
    state.bandwidth.clone().spawn_sampler();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!("IPTV proxy listening on {}", config.listen_addr);
    serve(listener, state, shutdown_rx).await
}
