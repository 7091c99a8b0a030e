use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use super::{AdaptationLogic, Sequence};
use crate::buffer::BufferState;
use crate::config::AdaptationConfig;
use crate::manifest::Manifest;
use crate::segment::{CompletedSegment, Segment};

/// Picks the best representation the measured throughput can sustain.
///
/// Throughput is the mean of the last `rate_history` completed downloads.
/// Before the first measurement the lowest representation is used.
pub struct RateBasedAdaptation {
    manifest: Arc<dyn Manifest>,
    history: VecDeque<u64>,
    window: usize,
    sequence: Sequence,
}

impl RateBasedAdaptation {
    pub fn new(config: &AdaptationConfig, manifest: Arc<dyn Manifest>) -> Self {
        let window = config.rate_history.max(1);
        Self {
            manifest,
            history: VecDeque::with_capacity(window),
            window,
            sequence: Sequence::default(),
        }
    }

    /// Mean throughput in bits per second, if anything was measured.
    pub fn estimate(&self) -> Option<u64> {
        if self.history.is_empty() {
            return None;
        }
        let sum: u128 = self.history.iter().map(|bps| u128::from(*bps)).sum();
        Some((sum / self.history.len() as u128) as u64)
    }

    fn select_level(&self) -> u32 {
        let Some(estimate) = self.estimate() else {
            return 0;
        };
        self.manifest
            .representations(self.manifest.current_period())
            .iter()
            .rposition(|repr| repr.bandwidth <= estimate)
            .map_or(0, |level| level as u32)
    }
}

impl AdaptationLogic for RateBasedAdaptation {
    fn next_segments(&mut self, _state: &BufferState<'_>) -> Vec<Segment> {
        let level = self.select_level();
        debug!(level, estimate = ?self.estimate(), "rate-based decision");
        self.sequence.take(self.manifest.as_ref(), level)
    }

    fn is_exhausted(&self, _state: &BufferState<'_>) -> bool {
        self.sequence.is_exhausted(self.manifest.as_ref())
    }

    fn segment_retrieved(&mut self, completed: &CompletedSegment) {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(completed.throughput_bps());
    }

    fn segment_failed(&mut self, segment: &Segment) {
        self.sequence.rewind(segment.number());
    }

    fn segment_abandoned(&mut self, segment: &Segment) {
        self.sequence.rewind(segment.number());
    }

    fn name(&self) -> &'static str {
        "rate-based"
    }
}
