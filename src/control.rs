use crate::directory::{Channel, ChannelStatus};
use crate::models::*;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

fn default_proxy_url(id: u64) -> String {
    format!("/stream/{}", id)
}

/// Upsert one channel (push from the admin store).
pub async fn put_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<u64>,
    Json(body): Json<ChannelUpsert>,
) -> StatusCode {
    state.directory.upsert(Channel {
        id: channel_id,
        name: body.name,
        source_url: body.source_url,
        proxy_url: body.proxy_url.unwrap_or_else(|| default_proxy_url(channel_id)),
        status: body.status.unwrap_or(ChannelStatus::Unknown),
    });
    tracing::info!("Channel {} upserted", channel_id);
    StatusCode::OK
}

/// Remove a channel. Any live upstream session for it is stopped; its
/// subscribers see the stream close.
pub async fn delete_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<u64>,
) -> StatusCode {
    state.directory.remove(channel_id);

    if let Some(session) = state.sessions.get(channel_id) {
        session.request_stop();
        tracing::info!("Channel {} removed, upstream session stopped", channel_id);
    } else {
        tracing::info!("Channel {} removed", channel_id);
    }

    StatusCode::OK
}

/// Full-directory replace. Channels absent from the payload are dropped and
/// their sessions stopped; channels still present keep streaming.
pub async fn sync(State(state): State<Arc<AppState>>, Json(req): Json<SyncRequest>) -> StatusCode {
    let channels: Vec<Channel> = req
        .channels
        .into_iter()
        .map(|def| Channel {
            id: def.id,
            name: def.name,
            source_url: def.source_url,
            proxy_url: def.proxy_url.unwrap_or_else(|| default_proxy_url(def.id)),
            status: def.status.unwrap_or(ChannelStatus::Unknown),
        })
        .collect();

    let removed = state.directory.replace_all(channels);
    for id in removed {
        if let Some(session) = state.sessions.get(id) {
            session.request_stop();
            tracing::info!("Sync: stopped session for removed channel {}", id);
        }
    }

    tracing::info!("Sync complete: {} channels", state.directory.len());
    StatusCode::OK
}
