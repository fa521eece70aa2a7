//! Everything a [`Client`](crate::client::Client) is built from.
//!
//! Usually you don't touch these directly and go through
//! [`ClientBuilder`](crate::client::ClientBuilder) instead.

use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::event::EventKind;
use crate::model::UpdateStatusPayload;

pub const DEFAULT_API_URL: &str = "https://discord.com/api/v10";
pub const GATEWAY_VERSION: u8 = 10;

/// Every non-privileged intent plus guild presences and members.
pub const DEFAULT_INTENTS: u64 = 32767;

/// Minimum spacing between two identifies sharing one token.
pub const DEFAULT_IDENTIFY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub api_url: String,
    /// Skips the `GET /gateway/bot` lookup when set.
    pub gateway_url: Option<String>,
    pub intents: u64,
    /// Sent with every identify. Replaced by whatever was last emitted.
    pub presence: Option<UpdateStatusPayload>,
    pub shards: ShardConfig,
    pub cache: bool,
    pub identify_interval: Duration,
    pub voice: VoiceConfig,
    pub reconnect: ReconnectConfig,
    /// Events of these kinds never reach handlers.
    pub ignore_events: Vec<EventKind>,
}

impl Config {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_url: DEFAULT_API_URL.to_string(),
            gateway_url: None,
            intents: DEFAULT_INTENTS,
            presence: None,
            shards: ShardConfig::default(),
            cache: true,
            identify_interval: DEFAULT_IDENTIFY_INTERVAL,
            voice: VoiceConfig::default(),
            reconnect: ReconnectConfig::default(),
            ignore_events: Vec::new(),
        }
    }
}

/// Which shards this process runs, out of how many in total.
///
/// Leave both empty for a single shard. Several processes can split one bot
/// by giving each the same `shard_count` and disjoint `shard_ids`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardConfig {
    pub shard_ids: Vec<u32>,
    pub shard_count: u32,
}

impl ShardConfig {
    pub fn new(shard_ids: Vec<u32>, shard_count: u32) -> Self {
        Self {
            shard_ids,
            shard_count,
        }
    }

    /// Works out the sorted, de-duplicated shard IDs and the total count.
    pub fn resolve(&self) -> Result<(Vec<u32>, u32)> {
        let mut ids = self.shard_ids.clone();
        ids.sort_unstable();
        ids.dedup();

        let count = match (ids.last(), self.shard_count) {
            (None, 0) => return Ok((vec![0], 1)),
            (None, count) => return Ok(((0..count).collect(), count)),
            (Some(&max), 0) => max.checked_add(1).ok_or_else(|| {
                ClientError::Api(format!("shard id {max} is out of range for any shard count"))
            })?,
            (Some(_), count) => count,
        };

        if let Some(bad) = ids.iter().find(|id| **id >= count) {
            return Err(ClientError::Api(format!(
                "shard id {bad} is out of range for a shard count of {count}"
            )));
        }

        Ok((ids, count))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VoiceConfig {
    /// How long `voice_connect` waits for both confirmation events.
    pub connect_timeout: Duration,
    pub move_timeout: Duration,
    /// `close` gives up waiting for the leave confirmation after this.
    pub close_grace: Duration,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            move_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts before a shard gives up.
    pub max_attempts: u32,
    pub hello_timeout: Duration,
    /// How long to wait for READY/RESUMED after identify or resume.
    pub handshake_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            hello_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

impl ReconnectConfig {
    /// Exponential backoff with up to 25% jitter on top.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        exp + exp.mul_f64(rand::random::<f64>() * 0.25)
    }
}
