// Playback buffer and per-layer occupancy tracking.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

/// Bounded store of buffered playback time.
///
/// Admission and consumption either apply completely or leave the buffer
/// untouched, so the fill always stays within `[0, max]`.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    buffered: Duration,
    max: Duration,
}

impl PlaybackBuffer {
    pub fn new(max: Duration) -> Self {
        Self {
            buffered: Duration::ZERO,
            max,
        }
    }

    /// Admit `duration` of playback time. Fails without changes if it does not fit.
    pub fn add_data(&mut self, duration: Duration) -> bool {
        match self.buffered.checked_add(duration) {
            Some(total) if total <= self.max => {
                self.buffered = total;
                true
            }
            _ => false,
        }
    }

    /// Consume one `interval` of playback. Fails without changes on underrun.
    pub fn consume_data(&mut self, interval: Duration) -> bool {
        if self.buffered < interval {
            return false;
        }
        self.buffered -= interval;
        true
    }

    /// Play out whatever is left, returning the drained amount.
    pub fn drain(&mut self) -> Duration {
        std::mem::take(&mut self.buffered)
    }

    pub fn buffered(&self) -> Duration {
        self.buffered
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_zero()
    }

    pub fn has_room_for(&self, duration: Duration) -> bool {
        self.buffered
            .checked_add(duration)
            .is_some_and(|total| total <= self.max)
    }
}

/// Which segment numbers are buffered on which quality level.
///
/// Segments credited to the playback buffer are also queued with their
/// duration, so consumption can be mapped back onto segment numbers and played
/// segments dropped from every level.
#[derive(Debug, Clone, Default)]
pub struct LayerOccupancy {
    levels: BTreeMap<u32, BTreeSet<u64>>,
    /// Credited segments still (partly) unplayed, with their unplayed time.
    playout: VecDeque<(u64, Duration)>,
    last_consumed: Option<u64>,
}

impl LayerOccupancy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a buffered layer. Returns false for segments that were already played.
    pub fn record(&mut self, level: u32, number: u64) -> bool {
        if self.is_played(number) {
            return false;
        }
        self.levels.entry(level).or_default().insert(number)
    }

    /// Queue `duration` of playback for segment `number`.
    pub fn schedule_playout(&mut self, number: u64, duration: Duration) -> bool {
        if self.is_played(number) || self.playout.iter().any(|(n, _)| *n == number) {
            return false;
        }
        let at = self.playout.partition_point(|(n, _)| *n < number);
        self.playout.insert(at, (number, duration));
        true
    }

    fn is_played(&self, number: u64) -> bool {
        self.last_consumed.is_some_and(|last| number <= last)
    }

    pub fn buffered_count(&self, level: u32) -> usize {
        self.levels.get(&level).map_or(0, BTreeSet::len)
    }

    pub fn last_segment_number(&self, level: u32) -> Option<u64> {
        self.levels
            .get(&level)
            .and_then(|numbers| numbers.last().copied())
    }

    pub fn contains(&self, level: u32, number: u64) -> bool {
        self.levels
            .get(&level)
            .is_some_and(|numbers| numbers.contains(&number))
    }

    /// Highest level that holds at least one segment.
    pub fn highest_level(&self) -> Option<u32> {
        self.levels
            .iter()
            .rev()
            .find(|(_, numbers)| !numbers.is_empty())
            .map(|(level, _)| *level)
    }

    pub fn last_consumed(&self) -> Option<u64> {
        self.last_consumed
    }

    /// Account `consumed` playback time and return the segment numbers that
    /// were fully played, in order.
    pub fn advance(&mut self, mut consumed: Duration) -> Vec<u64> {
        let mut played = Vec::new();
        while let Some((number, remaining)) = self.playout.front_mut() {
            if consumed < *remaining {
                *remaining -= consumed;
                break;
            }
            consumed -= *remaining;
            played.push(*number);
            self.playout.pop_front();
        }
        for number in &played {
            for numbers in self.levels.values_mut() {
                numbers.retain(|n| n > number);
            }
            self.last_consumed = Some(*number);
        }
        played
    }
}

/// Snapshot handed to the adaptation policies.
#[derive(Debug, Clone, Copy)]
pub struct BufferState<'a> {
    pub playback: &'a PlaybackBuffer,
    pub layers: &'a LayerOccupancy,
}
