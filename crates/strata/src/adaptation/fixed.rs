use std::sync::Arc;

use tracing::trace;

use super::{AdaptationLogic, Sequence};
use crate::buffer::BufferState;
use crate::manifest::Manifest;
use crate::segment::Segment;

/// Always fetches the same representation.
pub struct FixedAdaptation {
    manifest: Arc<dyn Manifest>,
    level: u32,
    name: &'static str,
    sequence: Sequence,
}

impl FixedAdaptation {
    pub fn lowest(manifest: Arc<dyn Manifest>) -> Self {
        Self {
            manifest,
            level: 0,
            name: "always-lowest",
            sequence: Sequence::default(),
        }
    }

    pub fn best(manifest: Arc<dyn Manifest>) -> Self {
        let level = manifest.levels().saturating_sub(1);
        Self {
            manifest,
            level,
            name: "always-best",
            sequence: Sequence::default(),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

impl AdaptationLogic for FixedAdaptation {
    fn next_segments(&mut self, _state: &BufferState<'_>) -> Vec<Segment> {
        let batch = self.sequence.take(self.manifest.as_ref(), self.level);
        trace!(policy = self.name, level = self.level, count = batch.len(), "fixed decision");
        batch
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
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptation::test_support::{buffer, manifest};

    #[test]
    fn lowest_stays_on_the_base() {
        let mut logic = FixedAdaptation::lowest(manifest(4, 3).into_shared());
        let (playback, layers) = buffer();
        let state = BufferState {
            playback: &playback,
            layers: &layers,
        };

        let levels: Vec<_> = std::iter::from_fn(|| logic.next_segments(&state).pop())
            .map(|s| (s.level(), s.number()))
            .collect();
        assert_eq!(levels, vec![(0, 0), (0, 1), (0, 2)]);
        assert!(logic.is_exhausted(&state));
    }

    #[test]
    fn abandoned_segment_is_handed_out_again() {
        let mut logic = FixedAdaptation::lowest(manifest(1, 3).into_shared());
        let (playback, layers) = buffer();
        let state = BufferState {
            playback: &playback,
            layers: &layers,
        };

        let first = logic.next_segments(&state).remove(0);
        let second = logic.next_segments(&state).remove(0);
        logic.segment_abandoned(&second);
        assert_eq!(logic.next_segments(&state), vec![second]);
        assert_eq!(first.number(), 0);

        let last = logic.next_segments(&state).remove(0);
        assert_eq!(last.number(), 2);
        assert!(logic.is_exhausted(&state));
        logic.segment_abandoned(&last);
        assert!(!logic.is_exhausted(&state));
    }

    #[test]
    fn best_picks_the_top_representation() {
        let logic = FixedAdaptation::best(manifest(4, 3).into_shared());
        assert_eq!(logic.level(), 3);
    }
}
