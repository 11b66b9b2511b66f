use crate::config::Config;
use crate::directory::{ChannelStatus, Directory};
use crate::error::ProxyError;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    Pending,
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub channel_id: u64,
    pub state: CheckState,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub checked: usize,
    pub total: usize,
    pub results: Vec<CheckResult>,
}

struct Job {
    targets: Vec<u64>,
    checked: AtomicUsize,
    results: DashMap<u64, CheckResult>,
}

impl Job {
    fn new(targets: Vec<u64>) -> Self {
        let results = DashMap::new();
        for &id in &targets {
            results.insert(
                id,
                CheckResult {
                    channel_id: id,
                    state: CheckState::Pending,
                    latency_ms: None,
                    error: None,
                },
            );
        }
        Self {
            targets,
            checked: AtomicUsize::new(0),
            results,
        }
    }
}

/// Batch channel reachability checks behind an opaque job token. Probes run
/// on a bounded worker pool so a full-directory check never opens unbounded
/// outbound connections, and never competes with relay concurrency. A
/// single-channel check is just a batch of one.
#[derive(Clone)]
pub struct HealthChecker {
    jobs: Arc<DashMap<Uuid, Arc<Job>>>,
    limiter: Arc<Semaphore>,
    client: reqwest::Client,
    directory: Arc<Directory>,
    probe_timeout: Duration,
    retention: Duration,
}

impl HealthChecker {
    pub fn new(config: &Config, directory: Arc<Directory>) -> Arc<Self> {
        Arc::new(Self {
            jobs: Arc::new(DashMap::new()),
            limiter: Arc::new(Semaphore::new(config.health_workers.max(1))),
            client: reqwest::Client::new(),
            directory,
            probe_timeout: config.probe_timeout,
            retention: config.job_retention,
        })
    }

    /// Enqueue probes for the given channels. Returns the token to poll.
    pub fn submit(&self, channel_ids: Vec<u64>) -> Uuid {
        let token = Uuid::new_v4();
        let job = Arc::new(Job::new(channel_ids));
        self.jobs.insert(token, job.clone());

        tracing::info!(
            "Health job {} submitted ({} channels)",
            token,
            job.targets.len()
        );

        if job.targets.is_empty() {
            self.schedule_eviction(token);
            return token;
        }

        for &channel_id in &job.targets {
            let worker = self.clone();
            let job = job.clone();
            tokio::spawn(async move {
                worker.run_target(token, job, channel_id).await;
            });
        }

        token
    }

    /// Check the whole directory.
    pub fn submit_all(&self) -> Uuid {
        self.submit(self.directory.ids())
    }

    /// Poll a job. Idempotent; terminal once `checked == total`.
    pub fn progress(&self, token: Uuid) -> Result<JobProgress, ProxyError> {
        let job = self.jobs.get(&token).ok_or(ProxyError::JobNotFound(token))?;
        let results = job
            .targets
            .iter()
            .filter_map(|id| job.results.get(id).map(|r| r.clone()))
            .collect();
        Ok(JobProgress {
            checked: job.checked.load(Ordering::Acquire).min(job.targets.len()),
            total: job.targets.len(),
            results,
        })
    }

    async fn run_target(self, token: Uuid, job: Arc<Job>, channel_id: u64) {
        // Bounds outbound probe concurrency; never shared with the relay.
        let _permit = self
            .limiter
            .acquire()
            .await
            .expect("health limiter closed");

        let outcome = match self.directory.get(channel_id) {
            Some(channel) => probe(&self.client, &channel.source_url, self.probe_timeout).await,
            None => Err(ProxyError::ChannelNotFound(channel_id)),
        };

        let result = match outcome {
            Ok(latency_ms) => {
                self.directory.update_status(channel_id, ChannelStatus::Active);
                CheckResult {
                    channel_id,
                    state: CheckState::Ok,
                    latency_ms: Some(latency_ms),
                    error: None,
                }
            }
            Err(error) => {
                self.directory
                    .update_status(channel_id, ChannelStatus::Inactive);
                CheckResult {
                    channel_id,
                    state: CheckState::Failed,
                    latency_ms: None,
                    error: Some(error.to_string()),
                }
            }
        };

        job.results.insert(channel_id, result);
        let done = job.checked.fetch_add(1, Ordering::AcqRel) + 1;
        if done == job.targets.len() {
            tracing::info!("Health job {} complete ({} channels)", token, done);
            self.schedule_eviction(token);
        }
    }

    fn schedule_eviction(&self, token: Uuid) {
        let jobs = self.jobs.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            jobs.remove(&token);
            tracing::debug!("Health job {} evicted", token);
        });
    }
}

/// Reachability probe: connect, require a non-error status, read the first
/// body bytes. The whole exchange shares one timeout.
async fn probe(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<u64, ProxyError> {
    let start = Instant::now();
    let attempt = async {
        let mut response = client
            .get(url)
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamUnreachable(format!("connect error: {}", e)))?;
        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            return Err(ProxyError::UpstreamUnreachable(format!("HTTP {}", status)));
        }
        response
            .chunk()
            .await
            .map_err(|e| ProxyError::UpstreamUnreachable(format!("read error: {}", e)))?;
        Ok(())
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => Ok(start.elapsed().as_millis() as u64),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProxyError::UpstreamTimeout),
    }
}
