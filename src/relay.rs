use crate::config::LagPolicy;
use crate::directory::ChannelStatus;
use crate::error::ProxyError;
use crate::session::SessionRegistry;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// TS null packet (188 bytes) used as keepalive while upstream is quiet.
fn ts_null_packet() -> Bytes {
    let mut pkt = vec![0u8; 188];
    pkt[0] = 0x47; // Sync byte
    pkt[1] = 0x1F; // PID 0x1FFF (null packet)
    pkt[2] = 0xFF;
    pkt[3] = 0x10; // Adaptation field control: payload only
    Bytes::from(pkt)
}

/// `GET /stream/{channel_id}` — relay the channel to one client. Joins the
/// channel's upstream session (starting it for the first viewer) and pipes
/// broadcast chunks into a streaming response body until either side closes.
pub async fn stream_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<u64>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let channel = match state.directory.get(channel_id) {
        Some(c) => c,
        None => return ProxyError::ChannelNotFound(channel_id).into_response(),
    };
    if channel.status == ChannelStatus::Inactive {
        return ProxyError::ChannelInactive(channel_id).into_response();
    }

    let session = state.sessions.get_or_start(&channel);
    let (guard, mut rx) =
        SessionRegistry::register_subscriber(&state.sessions, &session, addr.to_string());
    let subscriber_id = guard.id();
    let mut done_rx = session.done_rx();

    tracing::info!(
        "Channel {}: client {} connected from {}",
        channel_id,
        subscriber_id,
        addr
    );

    let bandwidth = state.bandwidth.clone();
    let lag_policy = state.config.lag_policy;
    let session = session.clone();

    let body_stream = async_stream::stream! {
        // Owned by the generator: a disconnecting client cancels this
        // future at an await point, and the guard's Drop still deregisters.
        let _guard = guard;
        let keepalive = ts_null_packet();
        let mut keepalive_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_data = Instant::now();

        // Session may have died between lookup and subscription.
        let mut live = !*done_rx.borrow();

        while live {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(chunk) => {
                            let len = chunk.len() as u64;
                            bandwidth.record_upload(channel_id, len);
                            if let Some(sub) = session.subscribers.get(&subscriber_id) {
                                sub.bytes_sent.fetch_add(len, Ordering::Relaxed);
                            }
                            last_data = Instant::now();
                            yield Ok::<_, std::io::Error>(chunk);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            match lag_policy {
                                LagPolicy::Disconnect => {
                                    tracing::warn!(
                                        "Channel {}: client {} lagged {} chunks, disconnecting",
                                        channel_id, subscriber_id, n
                                    );
                                    live = false;
                                }
                                LagPolicy::Skip => {
                                    tracing::warn!(
                                        "Channel {}: client {} lagged {} chunks, skipping",
                                        channel_id, subscriber_id, n
                                    );
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            live = false;
                        }
                    }
                }
                _ = done_rx.changed() => {
                    tracing::info!("Channel {}: upstream session ended", channel_id);
                    live = false;
                }
                _ = keepalive_interval.tick() => {
                    // Only pad the stream while upstream is quiet. Padding
                    // is not channel traffic; the tracker never sees it.
                    if last_data.elapsed() >= KEEPALIVE_INTERVAL {
                        yield Ok::<_, std::io::Error>(keepalive.clone());
                    }
                }
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap()
}
