use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Published rates for one channel, in bytes per second, plus lifetime
/// totals. "Upload" is traffic served to clients, "download" is traffic
/// pulled from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRates {
    pub upload_rate: u64,
    pub download_rate: u64,
    pub upload_total: u64,
    pub download_total: u64,
}

#[derive(Debug, Clone)]
pub struct BandwidthSnapshot {
    pub total_upload_rate: u64,
    pub total_download_rate: u64,
    pub channels_with_traffic: usize,
    pub channels: Vec<(u64, ChannelRates)>,
}

#[derive(Default)]
struct ChannelCounter {
    upload_delta: AtomicU64,
    download_delta: AtomicU64,
    upload_rate: AtomicU64,
    download_rate: AtomicU64,
    upload_total: AtomicU64,
    download_total: AtomicU64,
    /// Milliseconds since tracker epoch at the last recorded byte.
    last_traffic_ms: AtomicU64,
}

/// Per-channel bandwidth accounting. Relay and fetch loops record raw byte
/// deltas (lock-free atomic adds, independent per channel); a sampler tick
/// turns the accumulated deltas into rates. Channels with no traffic for
/// longer than the TTL are evicted, so snapshots never show stale non-zero
/// numbers.
pub struct BandwidthTracker {
    channels: DashMap<u64, ChannelCounter>,
    epoch: Instant,
    sample_interval: Duration,
    ttl: Duration,
}

impl BandwidthTracker {
    pub fn new(sample_interval: Duration, ttl: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            epoch: Instant::now(),
            sample_interval,
            ttl,
        }
    }

    pub fn record_upload(&self, channel_id: u64, bytes: u64) {
        let counter = self.channels.entry(channel_id).or_default();
        counter.upload_delta.fetch_add(bytes, Ordering::Relaxed);
        counter.upload_total.fetch_add(bytes, Ordering::Relaxed);
        counter
            .last_traffic_ms
            .store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn record_download(&self, channel_id: u64, bytes: u64) {
        let counter = self.channels.entry(channel_id).or_default();
        counter.download_delta.fetch_add(bytes, Ordering::Relaxed);
        counter.download_total.fetch_add(bytes, Ordering::Relaxed);
        counter
            .last_traffic_ms
            .store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn snapshot(&self, channel_id: u64) -> Option<ChannelRates> {
        self.channels.get(&channel_id).map(|c| ChannelRates {
            upload_rate: c.upload_rate.load(Ordering::Relaxed),
            download_rate: c.download_rate.load(Ordering::Relaxed),
            upload_total: c.upload_total.load(Ordering::Relaxed),
            download_total: c.download_total.load(Ordering::Relaxed),
        })
    }

    pub fn snapshot_all(&self) -> BandwidthSnapshot {
        let mut channels: Vec<(u64, ChannelRates)> = self
            .channels
            .iter()
            .map(|entry| {
                let c = entry.value();
                (
                    *entry.key(),
                    ChannelRates {
                        upload_rate: c.upload_rate.load(Ordering::Relaxed),
                        download_rate: c.download_rate.load(Ordering::Relaxed),
                        upload_total: c.upload_total.load(Ordering::Relaxed),
                        download_total: c.download_total.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        channels.sort_by_key(|(id, _)| *id);

        BandwidthSnapshot {
            total_upload_rate: channels.iter().map(|(_, r)| r.upload_rate).sum(),
            total_download_rate: channels.iter().map(|(_, r)| r.download_rate).sum(),
            channels_with_traffic: channels.len(),
            channels,
        }
    }

    /// One sampler tick: fold accumulated deltas into rates and evict
    /// channels past the TTL. Normally driven by [`spawn_sampler`]; tests
    /// call it directly.
    ///
    /// [`spawn_sampler`]: Self::spawn_sampler
    pub fn sample_once(&self) {
        let now_ms = self.now_ms();
        let ttl_ms = self.ttl.as_millis() as u64;
        let interval_ms = self.sample_interval.as_millis().max(1) as u64;

        self.channels.retain(|_, counter| {
            let upload = counter.upload_delta.swap(0, Ordering::Relaxed);
            let download = counter.download_delta.swap(0, Ordering::Relaxed);
            counter
                .upload_rate
                .store(upload * 1000 / interval_ms, Ordering::Relaxed);
            counter
                .download_rate
                .store(download * 1000 / interval_ms, Ordering::Relaxed);

            let last = counter.last_traffic_ms.load(Ordering::Relaxed);
            now_ms.saturating_sub(last) <= ttl_ms
        });
    }

    /// Background sampler driving [`sample_once`] on the configured tick.
    ///
    /// [`sample_once`]: Self::sample_once
    pub fn spawn_sampler(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tracker.sample_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tracker.sample_once();
            }
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Render a byte rate for humans ("2.5 MB/s").
pub fn format_rate(bytes_per_sec: u64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_sec as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes_per_sec, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
