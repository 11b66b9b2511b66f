use crate::bandwidth::format_rate;
use crate::error::ProxyError;
use crate::models::*;
use crate::state::AppState;
use crate::supervisor::SupervisorState;
use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

/// `GET /admin/proxy/status`
pub async fn proxy_status(State(state): State<Arc<AppState>>) -> Json<ProxyStatusResponse> {
    let running = state.lifecycle_state() == SupervisorState::Running;
    Json(ProxyStatusResponse {
        running,
        pid: running.then(std::process::id),
    })
}

/// `POST /admin/proxy/start` — answering at all proves this instance is
/// live; cold starts go through the CLI.
pub async fn proxy_start() -> Json<ActionResponse> {
    let err = ProxyError::AlreadyRunning(std::process::id() as i32);
    tracing::info!("Start requested via admin API: {}", err);
    Json(ActionResponse {
        success: false,
        error: Some(err.to_string()),
    })
}

/// `POST /admin/proxy/stop` — hand the serve loop a graceful-termination
/// request and acknowledge; the drain happens asynchronously.
pub async fn proxy_stop(State(state): State<Arc<AppState>>) -> Json<ActionResponse> {
    if state.lifecycle_state() != SupervisorState::Running {
        return Json(ActionResponse {
            success: false,
            error: Some(ProxyError::NotRunning.to_string()),
        });
    }
    state.request_shutdown();
    Json(ActionResponse {
        success: true,
        error: None,
    })
}

/// `GET /admin/proxy/connection-stats`
pub async fn connection_stats(
    State(state): State<Arc<AppState>>,
) -> Json<ConnectionStatsResponse> {
    let mut channels = Vec::new();
    let mut total = 0;
    for (channel_id, subscribers) in state.sessions.subscriber_counts() {
        let name = state
            .directory
            .get(channel_id)
            .map(|c| c.name)
            .unwrap_or_default();
        let connected_since = state
            .sessions
            .get(channel_id)
            .map(|s| format_instant(s.connected_since))
            .unwrap_or_default();
        total += subscribers;
        channels.push(ChannelConnections {
            channel_id,
            name,
            subscribers,
            connected_since,
        });
    }

    Json(ConnectionStatsResponse {
        channels,
        total_subscribers: total,
    })
}

/// `GET /admin/proxy/bandwidth-stats`
pub async fn bandwidth_stats(State(state): State<Arc<AppState>>) -> Json<BandwidthStatsResponse> {
    let snapshot = state.bandwidth.snapshot_all();

    let channels = snapshot
        .channels
        .iter()
        .map(|(channel_id, rates)| ChannelBandwidth {
            channel_id: *channel_id,
            upload: rate_pair(rates.upload_rate),
            download: rate_pair(rates.download_rate),
            upload_total: rates.upload_total,
            download_total: rates.download_total,
        })
        .collect();

    Json(BandwidthStatsResponse {
        success: true,
        data: BandwidthData {
            total: BandwidthTotals {
                upload: rate_pair(snapshot.total_upload_rate),
                download: rate_pair(snapshot.total_download_rate),
                channels_with_traffic: snapshot.channels_with_traffic,
            },
            channels,
        },
    })
}

/// `GET /admin/channels/check/{id}` — a single-channel check is a batch of
/// one, so every check flavor polls the same way.
pub async fn check_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<u64>,
) -> Result<Json<JobSubmitResponse>, ProxyError> {
    if state.directory.get(channel_id).is_none() {
        return Err(ProxyError::ChannelNotFound(channel_id));
    }
    Ok(Json(JobSubmitResponse {
        job_token: state.health.submit(vec![channel_id]),
    }))
}

/// `POST /admin/channels/check-multiple`
pub async fn check_multiple(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckMultipleRequest>,
) -> Json<JobSubmitResponse> {
    Json(JobSubmitResponse {
        job_token: state.health.submit(req.channel_ids),
    })
}

/// `POST /admin/channels/check-all`
pub async fn check_all(State(state): State<Arc<AppState>>) -> Json<JobSubmitResponse> {
    Json(JobSubmitResponse {
        job_token: state.health.submit_all(),
    })
}

/// `GET /admin/channels/check-progress/{token}`
pub async fn check_progress(
    State(state): State<Arc<AppState>>,
    Path(token): Path<Uuid>,
) -> Result<Json<crate::health::JobProgress>, ProxyError> {
    state.health.progress(token).map(Json)
}

fn rate_pair(bytes_per_sec: u64) -> RatePair {
    RatePair {
        bytes_per_sec,
        rate: format_rate(bytes_per_sec),
    }
}

fn format_instant(instant: tokio::time::Instant) -> String {
    let elapsed = instant.elapsed();
    let system_time = std::time::SystemTime::now() - elapsed;
    let datetime: chrono::DateTime<chrono::Utc> = system_time.into();
    datetime.to_rfc3339()
}
