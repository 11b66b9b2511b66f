use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Reachability status as known by the directory. `Unknown` covers both
/// never-checked channels and checks currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Inactive,
    Unknown,
}

/// A channel as supplied by the external admin store. The core never
/// mutates anything here except `status` (via health checks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: u64,
    pub name: String,
    pub source_url: String,
    pub proxy_url: String,
    #[serde(default = "default_status")]
    pub status: ChannelStatus,
}

fn default_status() -> ChannelStatus {
    ChannelStatus::Unknown
}

struct CacheEntry {
    fetched: Instant,
    channel: Channel,
}

/// Channel directory: the authoritative set pushed by the admin store over
/// the control API, fronted by a read-through cache with per-entry TTL.
/// Relay and health-check reads go through the cache; writes invalidate.
pub struct Directory {
    channels: DashMap<u64, Channel>,
    cache: DashMap<u64, CacheEntry>,
    cache_ttl: Duration,
}

impl Directory {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// Read-through lookup. Serves a cached copy while it is fresh, refills
    /// from the store otherwise. Concurrent readers never block a refresh;
    /// at worst two of them refill the same entry.
    pub fn get(&self, id: u64) -> Option<Channel> {
        if let Some(entry) = self.cache.get(&id) {
            if entry.fetched.elapsed() < self.cache_ttl {
                return Some(entry.channel.clone());
            }
        }
        let channel = self.channels.get(&id).map(|c| c.clone());
        match channel {
            Some(channel) => {
                self.cache.insert(
                    id,
                    CacheEntry {
                        fetched: Instant::now(),
                        channel: channel.clone(),
                    },
                );
                Some(channel)
            }
            None => {
                self.cache.remove(&id);
                None
            }
        }
    }

    /// Page through the directory, ordered by channel id. Returns the page
    /// plus the total channel count.
    pub fn list(&self, page: usize, page_size: usize) -> (Vec<Channel>, usize) {
        let mut all: Vec<Channel> = self.channels.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|c| c.id);
        let total = all.len();
        let start = page.saturating_mul(page_size).min(total);
        let end = start.saturating_add(page_size).min(total);
        (all[start..end].to_vec(), total)
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.channels.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Update a channel's status (health-check outcome). Returns false if
    /// the channel vanished from the store in the meantime.
    pub fn update_status(&self, id: u64, status: ChannelStatus) -> bool {
        match self.channels.get_mut(&id) {
            Some(mut channel) => {
                channel.status = status;
                self.cache.remove(&id);
                true
            }
            None => false,
        }
    }

    /// Insert or replace a channel (control-API push).
    pub fn upsert(&self, channel: Channel) {
        self.cache.remove(&channel.id);
        self.channels.insert(channel.id, channel);
    }

    /// Remove a channel (control-API delete). Returns the removed entry.
    pub fn remove(&self, id: u64) -> Option<Channel> {
        self.cache.remove(&id);
        self.channels.remove(&id).map(|(_, c)| c)
    }

    /// Replace the whole directory (control-API sync). Returns the ids that
    /// were present before but are gone now, so callers can stop their
    /// sessions.
    pub fn replace_all(&self, channels: Vec<Channel>) -> Vec<u64> {
        let new_ids: std::collections::HashSet<u64> = channels.iter().map(|c| c.id).collect();
        let removed: Vec<u64> = self
            .channels
            .iter()
            .map(|e| *e.key())
            .filter(|id| !new_ids.contains(id))
            .collect();
        for id in &removed {
            self.channels.remove(id);
        }
        for channel in channels {
            self.channels.insert(channel.id, channel);
        }
        self.cache.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: u64) -> Channel {
        Channel {
            id,
            name: format!("Channel {}", id),
            source_url: format!("http://origin.example/ch{}", id),
            proxy_url: format!("/stream/{}", id),
            status: ChannelStatus::Active,
        }
    }

    #[tokio::test]
    async fn get_and_upsert() {
        let dir = Directory::new(Duration::from_secs(30));
        assert!(dir.get(1).is_none());

        dir.upsert(channel(1));
        let got = dir.get(1).unwrap();
        assert_eq!(got.name, "Channel 1");
        assert_eq!(got.status, ChannelStatus::Active);
    }

    #[tokio::test]
    async fn update_status_invalidates_cache() {
        let dir = Directory::new(Duration::from_secs(3600));
        dir.upsert(channel(1));

        // Warm the cache, then write a new status through the store.
        assert_eq!(dir.get(1).unwrap().status, ChannelStatus::Active);
        assert!(dir.update_status(1, ChannelStatus::Inactive));
        assert_eq!(dir.get(1).unwrap().status, ChannelStatus::Inactive);
    }

    #[tokio::test]
    async fn update_status_on_missing_channel() {
        let dir = Directory::new(Duration::from_secs(30));
        assert!(!dir.update_status(99, ChannelStatus::Inactive));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let dir = Directory::new(Duration::from_secs(10));
        dir.upsert(channel(1));
        assert!(dir.get(1).is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        // Expired entry refills from the store rather than erroring.
        assert!(dir.get(1).is_some());
    }

    #[tokio::test]
    async fn list_pages_in_id_order() {
        let dir = Directory::new(Duration::from_secs(30));
        for id in [5, 3, 1, 4, 2] {
            dir.upsert(channel(id));
        }

        let (page, total) = dir.list(0, 2);
        assert_eq!(total, 5);
        assert_eq!(page.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);

        let (page, _) = dir.list(2, 2);
        assert_eq!(page.iter().map(|c| c.id).collect::<Vec<_>>(), vec![5]);

        let (page, _) = dir.list(9, 2);
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn replace_all_reports_removed_ids() {
        let dir = Directory::new(Duration::from_secs(30));
        for id in [1, 2, 3] {
            dir.upsert(channel(id));
        }

        let mut removed = dir.replace_all(vec![channel(2), channel(4)]);
        removed.sort_unstable();
        assert_eq!(removed, vec![1, 3]);
        assert_eq!(dir.ids(), vec![2, 4]);
    }
}
