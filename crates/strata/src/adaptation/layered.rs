// Buffer-driven layer selection for scalable content.
//
// Every level `i` below the current top level `i_curr` wants
// `gamma + ceil((i_curr - i) * alpha)` buffered segments, so lower layers build
// a deeper buffer than the ones above them. A decision runs three phases:
// steady (fill levels against `i_curr`), growing (fill against `i_curr + 2`)
// and quality increase (start level `i_curr + 1`).

use std::sync::Arc;

use tracing::{debug, trace};

use super::AdaptationLogic;
use crate::buffer::BufferState;
use crate::config::AdaptationConfig;
use crate::manifest::Manifest;
use crate::segment::{CompletedSegment, Segment};

/// Successful downloads needed before `alpha` decays.
const SUCCESS_STREAK: u32 = 10;
const ALPHA_DECAY: f64 = 0.95;
const ALPHA_GROWTH: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Steady,
    Growing,
    QualityIncrease,
}

pub struct LayeredAdaptation {
    manifest: Arc<dyn Manifest>,
    gamma: u32,
    alpha: f64,
    alpha_floor: f64,
    alpha_limit: f64,
    successes: u32,
}

impl LayeredAdaptation {
    pub fn new(config: &AdaptationConfig, manifest: Arc<dyn Manifest>) -> Self {
        Self {
            manifest,
            gamma: config.gamma,
            alpha: config.alpha,
            alpha_floor: config.alpha,
            alpha_limit: config.alpha_limit,
            successes: 0,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Buffered segments wanted on level `level` when `top` is the top level.
    fn desired_buffer_size(&self, level: u32, top: u32) -> usize {
        let depth = f64::from(top.saturating_sub(level)) * self.alpha;
        self.gamma as usize + depth.ceil() as usize
    }

    /// Next segment number needed on `level`.
    ///
    /// An empty base layer catches up with playback; an empty enhancement layer
    /// starts `gamma` segments ahead of it.
    fn next_needed(&self, state: &BufferState<'_>, level: u32) -> i64 {
        match state.layers.last_segment_number(level) {
            Some(last) => last as i64 + 1,
            None => {
                let consumed = state.layers.last_consumed().map_or(-1, |n| n as i64);
                if level == 0 {
                    consumed + 1
                } else {
                    consumed + i64::from(self.gamma)
                }
            }
        }
    }

    /// Segment number requestable on `level`, if it lies within the period.
    fn requestable(&self, state: &BufferState<'_>, level: u32) -> Option<u64> {
        let total = self.manifest.total_segments(self.manifest.current_period());
        let next = self.next_needed(state, level);
        (next >= 0 && (next as u64) < total).then_some(next as u64)
    }

    fn starved(&self, state: &BufferState<'_>, level: u32, top: u32) -> bool {
        state.layers.buffered_count(level) < self.desired_buffer_size(level, top)
    }

    /// First starved level of a phase, with its segment number.
    fn scan(&self, state: &BufferState<'_>, i_curr: u32, top: u32) -> Option<(u32, u64)> {
        (0..=i_curr)
            .filter(|level| self.starved(state, *level, top))
            .find_map(|level| self.requestable(state, level).map(|number| (level, number)))
    }

    fn decide(&self, state: &BufferState<'_>) -> Option<(Phase, u32, u64, u32)> {
        let levels = self.manifest.levels();
        let i_curr = state
            .layers
            .highest_level()
            .unwrap_or(0)
            .min(levels.saturating_sub(1));

        if let Some((level, number)) = self.scan(state, i_curr, i_curr) {
            return Some((Phase::Steady, level, number, i_curr));
        }
        if let Some((level, number)) = self.scan(state, i_curr, i_curr + 2) {
            return Some((Phase::Growing, level, number, i_curr + 2));
        }
        let next = i_curr + 1;
        if next < levels
            && let Some(number) = self.requestable(state, next)
        {
            return Some((Phase::QualityIncrease, next, number, next));
        }
        None
    }
}

impl AdaptationLogic for LayeredAdaptation {
    fn next_segments(&mut self, state: &BufferState<'_>) -> Vec<Segment> {
        let Some((phase, level, number, top)) = self.decide(state) else {
            trace!("no layer requestable");
            return Vec::new();
        };

        let mut batch: Vec<Segment> = self.manifest.segment(level, number).into_iter().collect();
        // Higher layers starved in the same phase and needing the same segment
        // ride along.
        if phase != Phase::QualityIncrease {
            let i_curr = if phase == Phase::Steady { top } else { top - 2 };
            for upper in level + 1..=i_curr {
                if self.starved(state, upper, top)
                    && self.requestable(state, upper) == Some(number)
                {
                    batch.extend(self.manifest.segment(upper, number));
                }
            }
        }

        debug!(
            ?phase,
            number,
            levels = ?batch.iter().map(Segment::level).collect::<Vec<_>>(),
            alpha = self.alpha,
            "layered decision"
        );
        batch
    }

    fn is_exhausted(&self, state: &BufferState<'_>) -> bool {
        self.requestable(state, 0).is_none()
    }

    fn is_layered(&self) -> bool {
        true
    }

    fn segment_retrieved(&mut self, _completed: &CompletedSegment) {
        self.successes += 1;
        if self.successes > SUCCESS_STREAK {
            self.successes = 0;
            self.alpha = (self.alpha * ALPHA_DECAY).max(self.alpha_floor);
        }
    }

    fn segment_failed(&mut self, segment: &Segment) {
        self.alpha = (self.alpha * ALPHA_GROWTH).min(self.alpha_limit);
        self.successes = 0;
        debug!(segment = %segment, alpha = self.alpha, "layer failed, buffering deeper");
    }

    fn name(&self) -> &'static str {
        "layered"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adaptation::test_support::{buffer, completed, manifest};
    use crate::buffer::{LayerOccupancy, PlaybackBuffer};

    fn logic(levels: u32, segments: u64) -> LayeredAdaptation {
        LayeredAdaptation::new(
            &AdaptationConfig::default(),
            manifest(levels, segments).into_shared(),
        )
    }

    fn decide(
        logic: &mut LayeredAdaptation,
        playback: &PlaybackBuffer,
        layers: &LayerOccupancy,
    ) -> Vec<(u32, u64)> {
        logic
            .next_segments(&BufferState { playback, layers })
            .iter()
            .map(|s| (s.level(), s.number()))
            .collect()
    }

    fn fill(layers: &mut LayerOccupancy, level: u32, numbers: std::ops::Range<u64>) {
        for number in numbers {
            layers.record(level, number);
        }
    }

    #[test]
    fn desired_buffer_grows_towards_the_base() {
        let logic = logic(4, 10);
        assert_eq!(logic.desired_buffer_size(2, 2), 3);
        assert_eq!(logic.desired_buffer_size(1, 2), 6);
        assert_eq!(logic.desired_buffer_size(0, 2), 9);
        assert_eq!(logic.desired_buffer_size(0, 4), 15);
    }

    #[test]
    fn starts_with_the_base_layer() {
        let mut logic = logic(3, 100);
        let (playback, layers) = buffer();
        assert_eq!(decide(&mut logic, &playback, &layers), vec![(0, 0)]);
    }

    #[test]
    fn grows_the_base_before_adding_a_layer() {
        let mut logic = logic(3, 100);
        let (playback, mut layers) = buffer();

        // Steady phase satisfied at 3, growing phase wants 3 + 2 * 3 = 9.
        fill(&mut layers, 0, 0..3);
        assert_eq!(decide(&mut logic, &playback, &layers), vec![(0, 3)]);

        fill(&mut layers, 0, 3..9);
        // Quality increase: empty level 1 starts gamma segments past playback.
        assert_eq!(decide(&mut logic, &playback, &layers), vec![(1, 2)]);
    }

    #[test]
    fn enhancement_layer_follows_playback() {
        let mut logic = logic(3, 100);
        let (playback, mut layers) = buffer();
        fill(&mut layers, 0, 0..12);
        for n in 0..5 {
            layers.schedule_playout(n, Duration::from_secs(2));
        }
        layers.advance(Duration::from_secs(10));
        assert_eq!(layers.last_consumed(), Some(4));

        // Base holds 5..12, seven segments against a growing target of nine.
        assert_eq!(decide(&mut logic, &playback, &layers), vec![(0, 12)]);

        fill(&mut layers, 0, 12..14);
        assert_eq!(decide(&mut logic, &playback, &layers), vec![(1, 7)]);
    }

    #[test]
    fn same_segment_layers_share_a_batch() {
        let mut logic = logic(4, 100);
        let (playback, mut layers) = buffer();
        fill(&mut layers, 0, 0..6);
        fill(&mut layers, 1, 0..3);
        fill(&mut layers, 2, 2..3);

        // Level 0 wants 9, level 1 wants 6 and level 2 wants 3. Only the base
        // needs segment 6.
        assert_eq!(decide(&mut logic, &playback, &layers), vec![(0, 6)]);

        fill(&mut layers, 0, 6..9);
        // Level 1 needs segment 3 and so does level 2.
        assert_eq!(decide(&mut logic, &playback, &layers), vec![(1, 3), (2, 3)]);
    }

    #[test]
    fn never_requests_past_the_period() {
        let mut logic = logic(2, 4);
        let (playback, mut layers) = buffer();
        fill(&mut layers, 0, 0..4);

        // Level 1 would start at segment 2, which still exists.
        assert_eq!(decide(&mut logic, &playback, &layers), vec![(1, 2)]);
        fill(&mut layers, 1, 2..4);
        let state = BufferState {
            playback: &playback,
            layers: &layers,
        };
        assert!(logic.next_segments(&state).is_empty());
        assert!(logic.is_exhausted(&state));
    }

    #[test]
    fn alpha_tracks_failures_and_streaks() {
        let mut logic = logic(2, 10);
        let segment = logic.manifest.segment(1, 0).unwrap();

        logic.segment_failed(&segment);
        assert!((logic.alpha() - 3.6).abs() < 1e-9);
        for _ in 0..5 {
            logic.segment_failed(&segment);
        }
        assert_eq!(logic.alpha(), 6.0);

        let done = completed(segment, 10, Duration::from_millis(100));
        for _ in 0..10 {
            logic.segment_retrieved(&done);
        }
        assert_eq!(logic.alpha(), 6.0);
        logic.segment_retrieved(&done);
        assert!((logic.alpha() - 5.7).abs() < 1e-9);

        for _ in 0..200 {
            logic.segment_retrieved(&done);
        }
        assert_eq!(logic.alpha(), 3.0);
    }
}
