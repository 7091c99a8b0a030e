use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{AdaptationLogic, Sequence};
use crate::buffer::BufferState;
use crate::config::AdaptationConfig;
use crate::manifest::Manifest;
use crate::segment::Segment;

/// Maps buffer fill onto the representation ladder.
///
/// Up to the reservoir the lowest representation is fetched, past
/// `reservoir + cushion` the best one, and in between the ladder is walked
/// linearly.
pub struct BufferBasedAdaptation {
    manifest: Arc<dyn Manifest>,
    reservoir: Duration,
    cushion: Duration,
    sequence: Sequence,
}

impl BufferBasedAdaptation {
    pub fn new(config: &AdaptationConfig, manifest: Arc<dyn Manifest>) -> Self {
        Self {
            manifest,
            reservoir: Duration::from_millis(config.reservoir_ms),
            cushion: Duration::from_millis(config.cushion_ms),
            sequence: Sequence::default(),
        }
    }

    fn select_level(&self, buffered: Duration) -> u32 {
        let top = self.manifest.levels().saturating_sub(1);
        if buffered <= self.reservoir {
            return 0;
        }
        if buffered >= self.reservoir + self.cushion || self.cushion.is_zero() {
            return top;
        }
        let fraction = (buffered - self.reservoir).as_secs_f64() / self.cushion.as_secs_f64();
        ((fraction * f64::from(top)).floor() as u32).min(top)
    }
}

impl AdaptationLogic for BufferBasedAdaptation {
    fn next_segments(&mut self, state: &BufferState<'_>) -> Vec<Segment> {
        let buffered = state.playback.buffered();
        let level = self.select_level(buffered);
        debug!(level, buffered_ms = buffered.as_millis() as u64, "buffer-based decision");
        self.sequence.take(self.manifest.as_ref(), level)
    }

    fn is_exhausted(&self, _state: &BufferState<'_>) -> bool {
        self.sequence.is_exhausted(self.manifest.as_ref())
    }

    fn segment_failed(&mut self, segment: &Segment) {
        self.sequence.rewind(segment.number());
    }

    fn segment_abandoned(&mut self, segment: &Segment) {
        self.sequence.rewind(segment.number());
    }

    fn name(&self) -> &'static str {
        "buffer-based"
    }
}
