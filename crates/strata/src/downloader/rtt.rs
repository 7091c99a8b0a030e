// Mean/deviation round trip time estimation with exponential timer backoff.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::config::RttConfig;

const MAX_MULTIPLIER: u32 = 64;

#[derive(Debug, Clone, Copy)]
struct Sent {
    at: Instant,
    retransmitted: bool,
}

#[derive(Debug, Clone)]
pub struct RttEstimator {
    config: RttConfig,
    srtt: Option<Duration>,
    rttvar: Duration,
    multiplier: u32,
    sent: HashMap<u32, Sent>,
}

impl RttEstimator {
    pub fn new(config: RttConfig) -> Self {
        Self {
            config,
            srtt: None,
            rttvar: Duration::ZERO,
            multiplier: 1,
            sent: HashMap::new(),
        }
    }

    /// Register a request for `chunk`. A second request for the same chunk
    /// marks it as retransmitted.
    pub fn sent(&mut self, chunk: u32, now: Instant) {
        let retransmitted = self.sent.contains_key(&chunk);
        self.sent.insert(
            chunk,
            Sent {
                at: now,
                retransmitted,
            },
        );
    }

    /// Take a sample for `chunk`. Samples of retransmitted chunks are ambiguous
    /// and are dropped.
    pub fn ack(&mut self, chunk: u32, now: Instant) -> Option<Duration> {
        let sent = self.sent.remove(&chunk)?;
        if sent.retransmitted {
            return None;
        }
        let sample = now.saturating_duration_since(sent.at);
        self.measurement(sample);
        Some(sample)
    }

    fn measurement(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let gain = self.config.gain;
                let err = sample.as_secs_f64() - srtt.as_secs_f64();
                let srtt = (srtt.as_secs_f64() + gain * err).max(0.0);
                let var = self.rttvar.as_secs_f64();
                let var = (var + gain * (err.abs() - var)).max(0.0);
                self.srtt = Some(Duration::from_secs_f64(srtt));
                self.rttvar = Duration::from_secs_f64(var);
            }
        }
        self.multiplier = 1;
        trace!(
            sample_ms = sample.as_millis() as u64,
            rto_ms = self.rto().as_millis() as u64,
            "rtt sample"
        );
    }

    pub fn increase_multiplier(&mut self) {
        self.multiplier = (self.multiplier * 2).min(MAX_MULTIPLIER);
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    pub fn srtt(&self) -> Duration {
        self.srtt.unwrap_or_else(|| self.config.initial_rtt())
    }

    /// Retransmission timeout including the backoff multiplier.
    pub fn rto(&self) -> Duration {
        let base = match self.srtt {
            Some(srtt) => srtt + self.rttvar * 4,
            None => self.config.initial_rtt(),
        };
        base.max(self.config.min_rto()) * self.multiplier
    }

    /// Timer length for the next request, bounded by the configured maximum.
    pub fn timer(&self) -> Duration {
        self.rto().min(self.config.max_rto())
    }

    /// Forget outstanding requests; the estimate itself is kept.
    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }
}
