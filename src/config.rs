use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What to do with a subscriber whose per-subscriber buffer overflows
/// (broadcast lag): drop the client, or skip the missed chunks and continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LagPolicy {
    Disconnect,
    Skip,
}

/// Runtime tunables. Every field has a hard default and can be overridden
/// through an `IPTV_PROXY_*` environment variable.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the relay listener binds to.
    pub listen_addr: SocketAddr,
    /// Upstream read is re-chunked to this size before fan-out.
    pub chunk_size: usize,
    /// Per-subscriber broadcast buffer, in chunks.
    pub broadcast_capacity: usize,
    /// How long an upstream session with zero subscribers stays alive.
    pub idle_grace: Duration,
    /// Bandwidth sampler tick.
    pub sample_interval: Duration,
    /// Channels with no traffic for this long drop out of snapshots.
    pub bandwidth_ttl: Duration,
    /// Read-through directory cache entry lifetime.
    pub directory_cache_ttl: Duration,
    /// Health probe timeout (connect + first body bytes).
    pub probe_timeout: Duration,
    /// Bounded health-check worker pool size.
    pub health_workers: usize,
    /// Completed health jobs remain pollable for this long.
    pub job_retention: Duration,
    /// In-flight relays get this long to drain on graceful shutdown.
    pub drain_grace: Duration,
    /// `stop` waits this long for SIGTERM to take before SIGKILL.
    pub stop_timeout: Duration,
    /// Liveness record path.
    pub pid_file: PathBuf,
    /// Slow-subscriber policy.
    pub lag_policy: LagPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8888)),
            chunk_size: 1024 * 1024,
            broadcast_capacity: 64,
            idle_grace: Duration::from_secs(30),
            sample_interval: Duration::from_secs(1),
            bandwidth_ttl: Duration::from_secs(300),
            directory_cache_ttl: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            health_workers: 8,
            job_retention: Duration::from_secs(300),
            drain_grace: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            pid_file: PathBuf::from("/tmp/iptv-proxy.pid"),
            lag_policy: LagPolicy::Disconnect,
        }
    }
}

impl Config {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable (unparseable values are logged).
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            listen_addr: env_parse("IPTV_PROXY_LISTEN", d.listen_addr),
            chunk_size: env_parse("IPTV_PROXY_CHUNK_SIZE", d.chunk_size),
            broadcast_capacity: env_parse("IPTV_PROXY_BROADCAST_CAPACITY", d.broadcast_capacity),
            idle_grace: env_secs("IPTV_PROXY_IDLE_GRACE_SECS", d.idle_grace),
            sample_interval: env_secs("IPTV_PROXY_SAMPLE_INTERVAL_SECS", d.sample_interval),
            bandwidth_ttl: env_secs("IPTV_PROXY_BANDWIDTH_TTL_SECS", d.bandwidth_ttl),
            directory_cache_ttl: env_secs("IPTV_PROXY_CACHE_TTL_SECS", d.directory_cache_ttl),
            probe_timeout: env_secs("IPTV_PROXY_PROBE_TIMEOUT_SECS", d.probe_timeout),
            health_workers: env_parse("IPTV_PROXY_HEALTH_WORKERS", d.health_workers),
            job_retention: env_secs("IPTV_PROXY_JOB_RETENTION_SECS", d.job_retention),
            drain_grace: env_secs("IPTV_PROXY_DRAIN_GRACE_SECS", d.drain_grace),
            stop_timeout: env_secs("IPTV_PROXY_STOP_TIMEOUT_SECS", d.stop_timeout),
            pid_file: std::env::var("IPTV_PROXY_PID_FILE")
                .map(PathBuf::from)
                .unwrap_or(d.pid_file),
            lag_policy: match std::env::var("IPTV_PROXY_LAG_POLICY").as_deref() {
                Ok("skip") => LagPolicy::Skip,
                Ok("disconnect") => LagPolicy::Disconnect,
                Ok(other) => {
                    tracing::warn!("Unknown IPTV_PROXY_LAG_POLICY '{}', using default", other);
                    d.lag_policy
                }
                Err(_) => d.lag_policy,
            },
        }
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid value for {} ('{}'), using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .unwrap_or_else(|_| {
                tracing::warn!("Invalid value for {} ('{}'), using default", key, raw);
                default
            }),
        Err(_) => default,
    }
}
