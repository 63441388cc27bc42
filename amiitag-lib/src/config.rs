use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Tunables for one device session. Durations are given in milliseconds when
/// deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Packet size before the handshake has seen any notification
    pub initial_packet_size: usize,
    /// Upper bound for the negotiated packet size
    pub max_packet_size: usize,
    #[serde(rename = "response_timeout_ms", deserialize_with = "millis")]
    pub response_timeout: Duration,
    #[serde(rename = "handshake_timeout_ms", deserialize_with = "millis")]
    pub handshake_timeout: Duration,
    /// Quiet period that ends a drain of stale notifications
    #[serde(rename = "drain_timeout_ms", deserialize_with = "millis")]
    pub drain_timeout: Duration,
    /// Extra reads allowed after a response fails validation
    pub max_read_retries: u32,
    pub max_pages_per_read: u8,
    /// Written to switch the device into binary mode
    pub trigger: String,
    /// Appears in the device output once binary mode is active
    pub marker: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_packet_size: 20,
            max_packet_size: 244,
            response_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_millis(250),
            max_read_retries: 3,
            max_pages_per_read: 63,
            trigger: "fastMode()\n".to_string(),
            marker: "FAST".to_string(),
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
