use crate::bandwidth::BandwidthTracker;
use crate::config::Config;
use crate::directory::Channel;
use crate::error::ProxyError;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use uuid::Uuid;

/// Per-client relay context, owned by the session's subscriber set.
pub struct SubscriberState {
    pub id: Uuid,
    pub connected_since: Instant,
    pub bytes_sent: AtomicU64,
    pub remote_addr: String,
}

/// One live upstream fetch for a channel. All concurrent viewers of the
/// channel subscribe to `sender`; the fetch loop is the only publisher, so
/// chunk order matches upstream read order.
pub struct UpstreamSession {
    pub channel_id: u64,
    pub source_url: String,
    pub connected_since: Instant,
    pub bytes_downloaded: AtomicU64,
    pub sender: broadcast::Sender<Bytes>,
    pub subscribers: DashMap<Uuid, SubscriberState>,
    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

impl UpstreamSession {
    /// Ask the fetch loop to wind down. Idempotent.
    pub fn request_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Resolves once the fetch loop has exited (stop, upstream failure, or
    /// upstream EOF).
    pub fn done_rx(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }
}

type SessionMap = Arc<DashMap<u64, Arc<UpstreamSession>>>;

/// Registry of live upstream sessions, keyed by channel id. The entry API
/// guarantees at most one session per channel: N viewers cost one upstream
/// connection.
pub struct SessionRegistry {
    sessions: SessionMap,
    config: Arc<Config>,
    bandwidth: Arc<BandwidthTracker>,
    client: reqwest::Client,
}

impl SessionRegistry {
    pub fn new(config: Arc<Config>, bandwidth: Arc<BandwidthTracker>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Arc::new(DashMap::new()),
            config,
            bandwidth,
            client: reqwest::Client::new(),
        })
    }

    /// Get the channel's live session, starting one if none exists. A
    /// session that has already terminated but not yet deregistered is
    /// replaced rather than handed out.
    pub fn get_or_start(&self, channel: &Channel) -> Arc<UpstreamSession> {
        loop {
            let session = self
                .sessions
                .entry(channel.id)
                .or_insert_with(|| self.start_session(channel))
                .clone();
            if !session.is_done() {
                return session;
            }
            // Lost the race with a dying session: drop it and retry.
            self.sessions
                .remove_if(&channel.id, |_, s| Arc::ptr_eq(s, &session));
        }
    }

    fn start_session(&self, channel: &Channel) -> Arc<UpstreamSession> {
        let (tx, _) = broadcast::channel::<Bytes>(self.config.broadcast_capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);

        let session = Arc::new(UpstreamSession {
            channel_id: channel.id,
            source_url: channel.source_url.clone(),
            connected_since: Instant::now(),
            bytes_downloaded: AtomicU64::new(0),
            sender: tx,
            subscribers: DashMap::new(),
            stop_tx,
            done_tx,
        });

        tokio::spawn(fetch_loop(
            self.sessions.clone(),
            self.bandwidth.clone(),
            self.client.clone(),
            self.config.clone(),
            session.clone(),
            stop_rx,
        ));

        session
    }

    pub fn get(&self, channel_id: u64) -> Option<Arc<UpstreamSession>> {
        self.sessions.get(&channel_id).map(|s| s.clone())
    }

    /// Register a new viewer on the session. The returned guard owns the
    /// registration: dropping it deregisters the viewer, which also covers
    /// a response body cancelled mid-stream by a client disconnect.
    pub fn register_subscriber(
        registry: &Arc<Self>,
        session: &Arc<UpstreamSession>,
        remote_addr: String,
    ) -> (SubscriberGuard, broadcast::Receiver<Bytes>) {
        let id = Uuid::new_v4();
        let rx = session.sender.subscribe();
        session.subscribers.insert(
            id,
            SubscriberState {
                id,
                connected_since: Instant::now(),
                bytes_sent: AtomicU64::new(0),
                remote_addr,
            },
        );
        (
            SubscriberGuard {
                registry: registry.clone(),
                session: session.clone(),
                id,
            },
            rx,
        )
    }

    /// Drop a viewer. Teardown of an empty session is delegated to an idle
    /// timer so a viewer arriving within the grace window reuses the live
    /// upstream connection.
    pub fn release_subscriber(&self, session: &Arc<UpstreamSession>, id: Uuid) {
        session.subscribers.remove(&id);
        if session.subscribers.is_empty() {
            let grace = self.config.idle_grace;
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if session.subscribers.is_empty() {
                    tracing::info!(
                        "Channel {}: no subscribers for {:?}, stopping upstream",
                        session.channel_id,
                        grace
                    );
                    session.request_stop();
                }
            });
        }
    }

    /// Subscriber count per channel with a live session.
    pub fn subscriber_counts(&self) -> Vec<(u64, usize)> {
        let mut counts: Vec<(u64, usize)> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), e.value().subscribers.len()))
            .collect();
        counts.sort_by_key(|(id, _)| *id);
        counts
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Request stop on every live session (graceful shutdown).
    pub fn stop_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().request_stop();
        }
    }

    /// Wait up to `grace` for all sessions to exit. Returns whether the
    /// registry drained in time.
    pub async fn wait_drained(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.sessions.is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.sessions.is_empty()
    }
}

/// One viewer's registration on a session. Deregistration lives in `Drop`
/// because hyper cancels the response body future at its await point when
/// the client goes away; explicit cleanup after the relay loop never runs
/// on that path.
pub struct SubscriberGuard {
    registry: Arc<SessionRegistry>,
    session: Arc<UpstreamSession>,
    id: Uuid,
}

impl SubscriberGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let sent = self
            .session
            .subscribers
            .get(&self.id)
            .map(|s| s.bytes_sent.load(Ordering::Relaxed))
            .unwrap_or(0);
        self.registry.release_subscriber(&self.session, self.id);
        tracing::info!(
            "Channel {}: client {} disconnected (sent {} bytes)",
            self.session.channel_id,
            self.id,
            sent
        );
    }
}

/// Background task driving one upstream session from connect to teardown.
async fn fetch_loop(
    sessions: SessionMap,
    bandwidth: Arc<BandwidthTracker>,
    client: reqwest::Client,
    config: Arc<Config>,
    session: Arc<UpstreamSession>,
    mut stop_rx: watch::Receiver<bool>,
) {
    tracing::info!(
        "Channel {}: connecting to upstream {}",
        session.channel_id,
        session.source_url
    );

    let result = fetch_upstream(&bandwidth, &client, &config, &session, &mut stop_rx).await;

    match result {
        Ok(()) => {
            tracing::info!("Channel {}: stop signal received", session.channel_id);
        }
        Err(e) => {
            tracing::warn!("Channel {}: upstream failed: {}", session.channel_id, e);
        }
    }

    // Deregister only our own entry; a replacement session may already
    // occupy the slot.
    sessions.remove_if(&session.channel_id, |_, s| Arc::ptr_eq(s, &session));
    // send_replace: must mark done even if nobody is watching yet.
    session.done_tx.send_replace(true);
    tracing::info!("Channel {}: upstream session closed", session.channel_id);
}

async fn fetch_upstream(
    bandwidth: &BandwidthTracker,
    client: &reqwest::Client,
    config: &Config,
    session: &UpstreamSession,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    use futures_util::StreamExt;

    let response = tokio::time::timeout(config.probe_timeout, client.get(&session.source_url).send())
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)?
        .map_err(|e| ProxyError::UpstreamUnreachable(format!("connect error: {}", e)))?;

    if !response.status().is_success() {
        return Err(ProxyError::UpstreamUnreachable(format!(
            "HTTP {}",
            response.status()
        )));
    }

    let chunk_size = config.chunk_size;
    let mut byte_stream = response.bytes_stream();
    let mut buffer = Vec::with_capacity(chunk_size);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                return Ok(());
            }
            chunk = byte_stream.next() => {
                match chunk {
                    Some(Ok(data)) => {
                        buffer.extend_from_slice(&data);
                        for chunk in drain_chunks(&mut buffer, chunk_size) {
                            publish(bandwidth, session, chunk);
                        }
                    }
                    Some(Err(e)) => {
                        return Err(ProxyError::UpstreamUnreachable(format!("read error: {}", e)));
                    }
                    None => {
                        if !buffer.is_empty() {
                            let rest = Bytes::from(std::mem::take(&mut buffer));
                            publish(bandwidth, session, rest);
                        }
                        return Err(ProxyError::UpstreamUnreachable(
                            "upstream closed the stream".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

fn publish(bandwidth: &BandwidthTracker, session: &UpstreamSession, chunk: Bytes) {
    let len = chunk.len() as u64;
    session.bytes_downloaded.fetch_add(len, Ordering::Relaxed);
    bandwidth.record_download(session.channel_id, len);
    // No receivers is fine; the idle timer handles teardown.
    let _ = session.sender.send(chunk);
}

/// Split off as many full chunks as the buffer holds, preserving order.
fn drain_chunks(buffer: &mut Vec<u8>, chunk_size: usize) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    while buffer.len() >= chunk_size {
        chunks.push(Bytes::copy_from_slice(&buffer[..chunk_size]));
        buffer.drain(..chunk_size);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ChannelStatus;

    fn test_channel(id: u64) -> Channel {
        Channel {
            id,
            name: format!("ch{}", id),
            // Nothing listens here; the fetch fails fast, which is fine for
            // registry-level tests.
            source_url: "http://127.0.0.1:1/stream".to_string(),
            proxy_url: format!("/stream/{}", id),
            status: ChannelStatus::Active,
        }
    }

    fn registry() -> Arc<SessionRegistry> {
        let config = Arc::new(Config::default());
        let bandwidth = Arc::new(BandwidthTracker::new(
            config.sample_interval,
            config.bandwidth_ttl,
        ));
        SessionRegistry::new(config, bandwidth)
    }

    #[test]
    fn drain_chunks_splits_in_order() {
        let mut buffer: Vec<u8> = (0u8..10).collect();
        let chunks = drain_chunks(&mut buffer, 4);
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0][..], &[0, 1, 2, 3]);
        assert_eq!(&chunks[1][..], &[4, 5, 6, 7]);
        assert_eq!(buffer, vec![8, 9]);
    }

    #[test]
    fn drain_chunks_leaves_partial_buffer() {
        let mut buffer = vec![1u8, 2, 3];
        assert!(drain_chunks(&mut buffer, 8).is_empty());
        assert_eq!(buffer.len(), 3);
    }

    // Current-thread runtime: the spawned fetch loop cannot run between the
    // two calls, so this observes the entry-API guarantee directly.
    #[tokio::test]
    async fn one_session_per_channel() {
        let registry = registry();
        let channel = test_channel(1);

        let first = registry.get_or_start(&channel);
        let second = registry.get_or_start(&channel);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.active_sessions(), 1);

        let other = registry.get_or_start(&test_channel(2));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.active_sessions(), 2);
    }

    #[tokio::test]
    async fn subscriber_counts_track_registration() {
        let registry = registry();
        let channel = test_channel(1);
        let session = registry.get_or_start(&channel);

        let (a, _rx_a) =
            SessionRegistry::register_subscriber(&registry, &session, "10.0.0.1:1000".into());
        let (_b, _rx_b) =
            SessionRegistry::register_subscriber(&registry, &session, "10.0.0.2:1000".into());
        assert_eq!(registry.subscriber_counts(), vec![(1, 2)]);

        drop(a);
        assert_eq!(registry.subscriber_counts(), vec![(1, 1)]);
    }

    #[tokio::test]
    async fn dropped_guard_releases_its_subscriber() {
        let registry = registry();
        let session = registry.get_or_start(&test_channel(1));

        let (guard, _rx) =
            SessionRegistry::register_subscriber(&registry, &session, "10.0.0.9:1".into());
        assert_eq!(session.subscribers.len(), 1);

        // Dropping the guard stands in for a client disconnect cancelling
        // the response body.
        drop(guard);
        assert_eq!(session.subscribers.len(), 0);
    }

    #[tokio::test]
    async fn stop_all_requests_stop() {
        let registry = registry();
        let session = registry.get_or_start(&test_channel(1));
        let mut done = session.done_rx();

        registry.stop_all();
        // The fetch loop exits on the stop signal (or on the failed connect)
        // and deregisters either way.
        tokio::time::timeout(Duration::from_secs(10), done.changed())
            .await
            .expect("session did not wind down")
            .unwrap();
        assert!(registry.wait_drained(Duration::from_secs(1)).await);
    }
}
