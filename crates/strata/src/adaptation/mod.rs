//! Adaptation policies: which segment, at which quality, comes next.
//!
//! A policy is a decision function over the buffer state and the manifest.
//! [`build`] resolves an [`AdaptationConfig`] into one concrete policy once,
//! at player construction.

mod buffer_based;
mod fixed;
mod layered;
mod rate_based;

use std::sync::Arc;

pub use self::buffer_based::BufferBasedAdaptation;
pub use self::fixed::FixedAdaptation;
pub use self::layered::LayeredAdaptation;
pub use self::rate_based::RateBasedAdaptation;
pub use crate::config::{AdaptationConfig, AdaptationKind};

use crate::buffer::BufferState;
use crate::error::{Result, StrataError};
use crate::manifest::Manifest;
use crate::segment::{CompletedSegment, Segment};

pub trait AdaptationLogic: Send {
    /// Layers to fetch next, all for the same segment number and ordered by
    /// level. Empty when nothing is requestable right now.
    fn next_segments(&mut self, state: &BufferState<'_>) -> Vec<Segment>;

    /// Whether every segment of the current period has been handed out, so an
    /// empty `next_segments` means end of content rather than idle.
    fn is_exhausted(&self, state: &BufferState<'_>) -> bool;

    /// Layered policies need the base layer before a segment can be played.
    fn is_layered(&self) -> bool {
        false
    }

    fn segment_retrieved(&mut self, _completed: &CompletedSegment) {}

    /// The network refused `segment`.
    fn segment_failed(&mut self, _segment: &Segment) {}

    /// `segment` was handed out but dropped before it arrived, typically by
    /// the salvage after a stall. It still has to be played.
    fn segment_abandoned(&mut self, _segment: &Segment) {}

    fn segment_consumed(&mut self, _number: u64) {}

    fn name(&self) -> &'static str;
}

/// Resolve the configured policy against `manifest`.
///
/// Fails when the manifest has nothing to play.
pub fn build(
    config: &AdaptationConfig,
    manifest: Arc<dyn Manifest>,
) -> Result<Box<dyn AdaptationLogic>> {
    let period = manifest.current_period();
    if manifest.representations(period).is_empty() {
        return Err(StrataError::manifest(format!(
            "period {period} has no representations"
        )));
    }
    if manifest.total_segments(period) == 0 {
        return Err(StrataError::manifest(format!(
            "period {period} has no segments"
        )));
    }

    let logic: Box<dyn AdaptationLogic> = match config.kind {
        AdaptationKind::Layered => Box::new(LayeredAdaptation::new(config, manifest)),
        AdaptationKind::RateBased => Box::new(RateBasedAdaptation::new(config, manifest)),
        AdaptationKind::BufferBased => Box::new(BufferBasedAdaptation::new(config, manifest)),
        AdaptationKind::AlwaysLowest => Box::new(FixedAdaptation::lowest(manifest)),
        AdaptationKind::AlwaysBest => Box::new(FixedAdaptation::best(manifest)),
    };
    Ok(logic)
}

/// Running segment counter of the single-representation policies.
#[derive(Debug, Clone, Default)]
struct Sequence {
    next: u64,
}

impl Sequence {
    /// Hand out the next segment at `level`, if the period has one left.
    fn take(&mut self, manifest: &dyn Manifest, level: u32) -> Vec<Segment> {
        match manifest.segment(level, self.next) {
            Some(segment) => {
                self.next += 1;
                vec![segment]
            }
            None => Vec::new(),
        }
    }

    fn is_exhausted(&self, manifest: &dyn Manifest) -> bool {
        self.next >= manifest.total_segments(manifest.current_period())
    }

    /// Fetch `number` again.
    fn rewind(&mut self, number: u64) {
        self.next = self.next.min(number);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::buffer::BufferState;

    #[test]
    fn builds_every_kind() {
        let manifest = manifest(3, 5).into_shared();
        for (kind, name) in [
            (AdaptationKind::Layered, "layered"),
            (AdaptationKind::RateBased, "rate-based"),
            (AdaptationKind::BufferBased, "buffer-based"),
            (AdaptationKind::AlwaysLowest, "always-lowest"),
            (AdaptationKind::AlwaysBest, "always-best"),
        ] {
            let config = AdaptationConfig {
                kind,
                ..AdaptationConfig::default()
            };
            let logic = build(&config, manifest.clone()).unwrap();
            assert_eq!(logic.name(), name);
        }
    }

    #[test]
    fn fixed_policies_walk_the_period_once() {
        let manifest = manifest(3, 2).into_shared();
        let config = AdaptationConfig {
            kind: AdaptationKind::AlwaysBest,
            ..AdaptationConfig::default()
        };
        let mut logic = build(&config, manifest).unwrap();
        let (playback, layers) = buffer();
        let state = BufferState {
            playback: &playback,
            layers: &layers,
        };

        let first = logic.next_segments(&state);
        assert_eq!(first.len(), 1);
        assert_eq!((first[0].level(), first[0].number()), (2, 0));
        assert_eq!(logic.next_segments(&state)[0].number(), 1);
        assert!(logic.is_exhausted(&state));
        assert!(logic.next_segments(&state).is_empty());

        // A failed segment is fetched again.
        logic.segment_failed(&first[0]);
        assert!(!logic.is_exhausted(&state));
        assert_eq!(logic.next_segments(&state)[0].number(), 0);
    }
}
