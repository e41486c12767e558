//! Session configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DecodeLimits;
use crate::protocol::{AUTH_PROTOCOL_VERSION, DEFAULT_PLATFORM};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

pub const DEFAULT_ORIGIN: &str = "https://live.bilibili.com";

/// Exponential reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the reconnect that follows `retry_count` earlier attempts:
    /// `min(base * 2^retry_count, max)`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let delay = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Configuration for a live danmaku session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Interval between heartbeat frames
    pub heartbeat_interval_ms: u64,
    pub reconnect: ReconnectPolicy,
    /// Items buffered per fan-out subscriber
    pub channel_capacity: usize,
    /// MESSAGE bodies queued for parsing before new ones are dropped
    pub dispatch_queue: usize,
    /// Maximum nesting of compressed frames
    pub max_decode_depth: usize,
    /// Maximum bytes inflated per inbound buffer
    pub max_decompressed_size: usize,
    /// Platform tag sent in the auth payload
    pub platform: String,
    /// Protocol version requested in the auth payload
    pub protover: u8,
    /// Headers sent with the WebSocket upgrade request
    pub headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let limits = DecodeLimits::default();
        let headers = [
            ("User-Agent", DEFAULT_USER_AGENT),
            ("Origin", DEFAULT_ORIGIN),
            ("Referer", DEFAULT_ORIGIN),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            heartbeat_interval_ms: 30_000,
            reconnect: ReconnectPolicy::default(),
            channel_capacity: crate::channel::DEFAULT_CAPACITY,
            dispatch_queue: 1024,
            max_decode_depth: limits.max_depth,
            max_decompressed_size: limits.max_decompressed_size,
            platform: DEFAULT_PLATFORM.to_string(),
            protover: AUTH_PROTOCOL_VERSION,
            headers,
        }
    }
}

impl ClientConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn decode_limits(&self) -> DecodeLimits {
        DecodeLimits {
            max_depth: self.max_decode_depth,
            max_decompressed_size: self.max_decompressed_size,
        }
    }

    /// Headers as an ordered list of pairs.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
