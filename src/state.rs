use crate::bandwidth::BandwidthTracker;
use crate::config::Config;
use crate::directory::Directory;
use crate::health::HealthChecker;
use crate::session::SessionRegistry;
use crate::supervisor::SupervisorState;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Top-level application state shared across all handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub directory: Arc<Directory>,
    pub sessions: Arc<SessionRegistry>,
    pub bandwidth: Arc<BandwidthTracker>,
    pub health: Arc<HealthChecker>,
    shutdown_tx: mpsc::Sender<()>,
    lifecycle: watch::Sender<SupervisorState>,
}

impl AppState {
    /// Wire up the core. Returns the state plus the receiver the serve loop
    /// watches for admin-initiated shutdown.
    pub fn new(config: Arc<Config>) -> (Arc<Self>, mpsc::Receiver<()>) {
        let directory = Arc::new(Directory::new(config.directory_cache_ttl));
        let bandwidth = Arc::new(BandwidthTracker::new(
            config.sample_interval,
            config.bandwidth_ttl,
        ));
        let sessions = SessionRegistry::new(config.clone(), bandwidth.clone());
        let health = HealthChecker::new(&config, directory.clone());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (lifecycle, _) = watch::channel(SupervisorState::Starting);

        let state = Arc::new(Self {
            config,
            directory,
            sessions,
            bandwidth,
            health,
            shutdown_tx,
            lifecycle,
        });
        (state, shutdown_rx)
    }

    pub fn lifecycle_state(&self) -> SupervisorState {
        *self.lifecycle.borrow()
    }

    pub fn set_lifecycle_state(&self, state: SupervisorState) {
        // send_replace: the state must update even with no watchers.
        self.lifecycle.send_replace(state);
    }

    /// Request a graceful shutdown of the running instance. Idempotent;
    /// returns false if one is already in flight.
    pub fn request_shutdown(&self) -> bool {
        self.shutdown_tx.try_send(()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_transitions() {
        let (state, _rx) = AppState::new(Arc::new(Config::default()));
        assert_eq!(state.lifecycle_state(), SupervisorState::Starting);

        state.set_lifecycle_state(SupervisorState::Running);
        assert_eq!(state.lifecycle_state(), SupervisorState::Running);

        state.set_lifecycle_state(SupervisorState::Stopping);
        state.set_lifecycle_state(SupervisorState::Stopped);
        assert_eq!(state.lifecycle_state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_request_is_idempotent() {
        let (state, mut rx) = AppState::new(Arc::new(Config::default()));
        assert!(state.request_shutdown());
        // Channel holds one pending request; repeats are absorbed.
        let _ = state.request_shutdown();
        assert!(rx.recv().await.is_some());
    }
}
