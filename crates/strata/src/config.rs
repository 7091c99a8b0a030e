use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, StrataError};

// --- Congestion Window ---

/// How a downloader's congestion window reacts to network feedback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Slow start below the threshold, linear growth above it, halving on congestion.
    #[default]
    Aimd,
    /// Fixed window, feedback is ignored.
    Static,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub policy: WindowPolicy,
    /// Physical bitrate of the client link, used to derive the receiver window.
    pub link_bitrate_bps: u64,
    /// Per-packet header overhead on top of the chunk payload.
    pub packet_overhead: usize,
    /// Starting window size. `None` starts at the receiver window.
    pub initial_window: Option<u32>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            policy: WindowPolicy::Aimd,
            link_bitrate_bps: 10_000_000,
            packet_overhead: 50,
            initial_window: None,
        }
    }
}

// --- RTT Estimation ---

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RttConfig {
    /// Estimate used before the first sample arrives.
    pub initial_rtt_ms: u64,
    pub min_rto_ms: u64,
    /// Upper bound for a single retransmission timer.
    pub max_rto_ms: u64,
    /// Smoothing gain for the mean and deviation estimates.
    pub gain: f64,
}

impl Default for RttConfig {
    fn default() -> Self {
        Self {
            initial_rtt_ms: 500,
            min_rto_ms: 100,
            max_rto_ms: 1_000,
            gain: 0.125,
        }
    }
}

impl RttConfig {
    pub fn initial_rtt(&self) -> Duration {
        Duration::from_millis(self.initial_rtt_ms)
    }

    pub fn min_rto(&self) -> Duration {
        Duration::from_millis(self.min_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }
}

// --- Downloader ---

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Payload bytes carried by every data chunk except the last one.
    pub max_chunk_payload: usize,
    /// Chunk count assumed until chunk 0 reports the real segment length.
    pub initial_chunk_guess: u32,
    /// Give up on a segment once a single chunk was retried this often.
    pub chunk_retry_limit: Option<u32>,
    pub window: WindowConfig,
    pub rtt: RttConfig,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_chunk_payload: 4096,
            initial_chunk_guess: 10,
            chunk_retry_limit: None,
            window: WindowConfig::default(),
            rtt: RttConfig::default(),
        }
    }
}

// --- Adaptation ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationKind {
    /// Buffer-driven layer selection for scalable (layered) content.
    #[default]
    Layered,
    /// Highest representation not exceeding the recent mean throughput.
    RateBased,
    /// Representation picked from the playback buffer fill.
    BufferBased,
    AlwaysLowest,
    AlwaysBest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    pub kind: AdaptationKind,
    /// Minimum number of buffered segments wanted on the top layer.
    pub gamma: u32,
    /// Initial (and minimum) growth of the desired buffer per layer below the top.
    pub alpha: f64,
    /// Ceiling for `alpha` after repeated failures.
    pub alpha_limit: f64,
    /// Number of past downloads averaged by the rate-based policy.
    pub rate_history: usize,
    /// Buffer-based policy: below this fill the lowest representation is used.
    pub reservoir_ms: u64,
    /// Buffer-based policy: above `reservoir + cushion` the best representation is used.
    pub cushion_ms: u64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            kind: AdaptationKind::Layered,
            gamma: 3,
            alpha: 3.0,
            alpha_limit: 6.0,
            rate_history: 10,
            reservoir_ms: 4_000,
            cushion_ms: 10_000,
        }
    }
}

// --- Player ---

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Capacity of the playback buffer.
    pub max_buffer_ms: u64,
    /// Playback time consumed per consume tick.
    pub consume_interval_ms: u64,
    /// Delay between `play()` and the first consume tick.
    pub initial_consume_delay_ms: u64,
    /// Number of parallel downloaders in the pool.
    pub pool_size: usize,
    pub downloader: DownloaderConfig,
    pub adaptation: AdaptationConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            max_buffer_ms: 20_000,
            consume_interval_ms: 1_000,
            initial_consume_delay_ms: 2_000,
            pool_size: 4,
            downloader: DownloaderConfig::default(),
            adaptation: AdaptationConfig::default(),
        }
    }
}

impl PlayerConfig {
    pub fn builder() -> PlayerConfigBuilder {
        PlayerConfigBuilder::new()
    }

    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn max_buffer(&self) -> Duration {
        Duration::from_millis(self.max_buffer_ms)
    }

    pub fn consume_interval(&self) -> Duration {
        Duration::from_millis(self.consume_interval_ms)
    }

    pub fn initial_consume_delay(&self) -> Duration {
        Duration::from_millis(self.initial_consume_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_ms == 0 {
            return Err(StrataError::configuration("max_buffer_ms must be positive"));
        }
        if self.consume_interval_ms == 0 {
            return Err(StrataError::configuration(
                "consume_interval_ms must be positive",
            ));
        }
        if self.pool_size == 0 {
            return Err(StrataError::configuration("pool_size must be positive"));
        }
        if self.downloader.max_chunk_payload == 0 {
            return Err(StrataError::configuration(
                "max_chunk_payload must be positive",
            ));
        }
        if self.downloader.initial_chunk_guess == 0 {
            return Err(StrataError::configuration(
                "initial_chunk_guess must be positive",
            ));
        }
        if self.downloader.rtt.max_rto_ms == 0 {
            return Err(StrataError::configuration("max_rto_ms must be positive"));
        }
        if self.adaptation.alpha_limit < self.adaptation.alpha {
            return Err(StrataError::configuration(
                "alpha_limit must not be below alpha",
            ));
        }
        Ok(())
    }
}

pub struct PlayerConfigBuilder {
    config: PlayerConfig,
}

impl PlayerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PlayerConfig::default(),
        }
    }

    pub fn with_max_buffer(mut self, max_buffer: Duration) -> Self {
        self.config.max_buffer_ms = max_buffer.as_millis() as u64;
        self
    }

    pub fn with_consume_interval(mut self, interval: Duration) -> Self {
        self.config.consume_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_initial_consume_delay(mut self, delay: Duration) -> Self {
        self.config.initial_consume_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    pub fn with_adaptation(mut self, kind: AdaptationKind) -> Self {
        self.config.adaptation.kind = kind;
        self
    }

    pub fn with_window_policy(mut self, policy: WindowPolicy) -> Self {
        self.config.downloader.window.policy = policy;
        self
    }

    pub fn with_link_bitrate(mut self, bps: u64) -> Self {
        self.config.downloader.window.link_bitrate_bps = bps;
        self
    }

    pub fn with_downloader(mut self, downloader: DownloaderConfig) -> Self {
        self.config.downloader = downloader;
        self
    }

    pub fn with_adaptation_config(mut self, adaptation: AdaptationConfig) -> Self {
        self.config.adaptation = adaptation;
        self
    }

    pub fn build(self) -> Result<PlayerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for PlayerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PlayerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_buffer(), Duration::from_secs(20));
        assert_eq!(config.initial_consume_delay(), Duration::from_secs(2));
        assert_eq!(config.downloader.max_chunk_payload, 4096);
        assert_eq!(config.downloader.window.policy, WindowPolicy::Aimd);
    }

    #[test]
    fn json_overrides_only_given_fields() {
        let config = PlayerConfig::from_json(
            r#"{
                "pool_size": 2,
                "downloader": { "window": { "policy": "static", "initial_window": 8 } },
                "adaptation": { "kind": "rate_based" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.pool_size, 2);
        assert_eq!(config.downloader.window.policy, WindowPolicy::Static);
        assert_eq!(config.downloader.window.initial_window, Some(8));
        assert_eq!(config.downloader.max_chunk_payload, 4096);
        assert_eq!(config.adaptation.kind, AdaptationKind::RateBased);
        assert_eq!(config.adaptation.gamma, 3);
    }

    #[test]
    fn builder_rejects_empty_pool() {
        let err = PlayerConfig::builder().with_pool_size(0).build().unwrap_err();
        assert!(matches!(err, StrataError::Configuration { .. }));
    }

    #[test]
    fn invalid_json_is_reported() {
        let err = PlayerConfig::from_json("{ pool_size: }").unwrap_err();
        assert!(matches!(err, StrataError::Json { .. }));
    }
}
