use crate::directory::ChannelStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Control API models (directory push from the admin store) ---

#[derive(Debug, Deserialize)]
pub struct ChannelUpsert {
    pub name: String,
    pub source_url: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub status: Option<ChannelStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelDef {
    pub id: u64,
    pub name: String,
    pub source_url: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub status: Option<ChannelStatus>,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub channels: Vec<ChannelDef>,
}

// --- Admin API models ---

#[derive(Debug, Serialize)]
pub struct ProxyStatusResponse {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChannelConnections {
    pub channel_id: u64,
    pub name: String,
    pub subscribers: usize,
    pub connected_since: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectionStatsResponse {
    pub channels: Vec<ChannelConnections>,
    pub total_subscribers: usize,
}

/// A rate in raw bytes/sec plus its human-readable rendering.
#[derive(Debug, Serialize)]
pub struct RatePair {
    pub bytes_per_sec: u64,
    pub rate: String,
}

#[derive(Debug, Serialize)]
pub struct ChannelBandwidth {
    pub channel_id: u64,
    pub upload: RatePair,
    pub download: RatePair,
    pub upload_total: u64,
    pub download_total: u64,
}

#[derive(Debug, Serialize)]
pub struct BandwidthTotals {
    pub upload: RatePair,
    pub download: RatePair,
    pub channels_with_traffic: usize,
}

#[derive(Debug, Serialize)]
pub struct BandwidthData {
    pub total: BandwidthTotals,
    pub channels: Vec<ChannelBandwidth>,
}

#[derive(Debug, Serialize)]
pub struct BandwidthStatsResponse {
    pub success: bool,
    pub data: BandwidthData,
}

#[derive(Debug, Serialize)]
pub struct JobSubmitResponse {
    pub job_token: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CheckMultipleRequest {
    pub channel_ids: Vec<u64>,
}
