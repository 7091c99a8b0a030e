//! Playback statistics.
//!
//! The player reports into a [`StatsSink`]; nothing reported here feeds back
//! into decisions. [`PlaybackReport`] is the summary returned when playback ends.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::segment::{CompletedSegment, Segment, TransferStats};

pub trait StatsSink: Send {
    fn playback_started(&mut self, at: Instant);

    fn playback_stopped(&mut self, at: Instant);

    /// A batch was handed to the download manager; `level` is the highest layer requested.
    fn segment_requested(&mut self, number: u64, level: u32);

    fn segment_downloaded(&mut self, completed: &CompletedSegment);

    /// Consumption underran with nothing left to salvage; `number` is the
    /// segment that should have been playing.
    fn stall(&mut self, number: u64, buffered: Duration);
}

/// Emits every statistic as a `tracing` event.
#[derive(Debug, Default)]
pub struct TracingStats {
    started: Option<Instant>,
}

impl TracingStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn offset_ms(&self, at: Instant) -> u64 {
        self.started
            .map_or(0, |started| at.duration_since(started).as_millis() as u64)
    }
}

impl StatsSink for TracingStats {
    fn playback_started(&mut self, at: Instant) {
        self.started = Some(at);
        info!("playback started");
    }

    fn playback_stopped(&mut self, at: Instant) {
        info!(at_ms = self.offset_ms(at), "playback stopped");
    }

    fn segment_requested(&mut self, number: u64, level: u32) {
        debug!(number, level, "segment requested");
    }

    fn segment_downloaded(&mut self, completed: &CompletedSegment) {
        let segment = &completed.segment;
        debug!(
            number = segment.number(),
            level = segment.level(),
            bytes = completed.bytes.len(),
            start_ms = self.offset_ms(completed.started),
            elapsed_ms = completed.elapsed.as_millis() as u64,
            retransmissions = completed.stats.retransmissions(),
            "segment downloaded"
        );
    }

    fn stall(&mut self, number: u64, buffered: Duration) {
        warn!(
            number,
            buffered_ms = buffered.as_millis() as u64,
            "playback stalled"
        );
    }
}

/// One layer admitted during playback.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub segment: Segment,
    pub bytes: usize,
    pub elapsed: Duration,
    pub stats: TransferStats,
}

impl From<&CompletedSegment> for SegmentRecord {
    fn from(completed: &CompletedSegment) -> Self {
        Self {
            segment: completed.segment.clone(),
            bytes: completed.bytes.len(),
            elapsed: completed.elapsed,
            stats: completed.stats,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallRecord {
    /// Time since playback started.
    pub at: Duration,
    /// Segment that should have been playing.
    pub number: u64,
}

/// Summary of one playback session.
#[derive(Debug, Clone, Default)]
pub struct PlaybackReport {
    pub records: Vec<SegmentRecord>,
    pub stalls: Vec<StallRecord>,
    /// Layers dropped after an explicit reject, the rejected ones included.
    pub shed_layers: usize,
    /// Playback time consumed from the buffer.
    pub played: Duration,
    pub completed: bool,
}

impl PlaybackReport {
    pub fn bytes_downloaded(&self) -> usize {
        self.records.iter().map(|record| record.bytes).sum()
    }

    /// Segments played with at least the base layer.
    pub fn segments(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.segment.level() == 0)
            .count()
    }

    /// Mean number of layers per base-layer segment.
    pub fn mean_layers(&self) -> f64 {
        let base = self.segments();
        if base == 0 {
            return 0.0;
        }
        self.records.len() as f64 / base as f64
    }

    pub fn highest_level(&self) -> Option<u32> {
        self.records.iter().map(|record| record.segment.level()).max()
    }

    pub fn totals(&self) -> TransferStats {
        self.records
            .iter()
            .fold(TransferStats::default(), |mut acc, record| {
                acc.interests_sent += record.stats.interests_sent;
                acc.data_received += record.stats.data_received;
                acc.duplicates += record.stats.duplicates;
                acc.timeouts += record.stats.timeouts;
                acc.nacks += record.stats.nacks;
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn record(level: u32, number: u64, bytes: usize, timeouts: u64) -> SegmentRecord {
        let segment = Segment::new("/a", Duration::from_secs(2), level, 1, "L", number);
        let completed = CompletedSegment {
            segment,
            bytes: Bytes::from(vec![0u8; bytes]),
            started: Instant::now(),
            elapsed: Duration::from_millis(40),
            stats: TransferStats {
                interests_sent: 4 + timeouts,
                data_received: 4,
                timeouts,
                ..TransferStats::default()
            },
        };
        SegmentRecord::from(&completed)
    }

    #[test]
    fn report_summaries() {
        let report = PlaybackReport {
            records: vec![
                record(0, 0, 100, 0),
                record(1, 0, 200, 1),
                record(0, 1, 100, 2),
            ],
            ..PlaybackReport::default()
        };

        assert_eq!(report.bytes_downloaded(), 400);
        assert_eq!(report.segments(), 2);
        assert_eq!(report.mean_layers(), 1.5);
        assert_eq!(report.highest_level(), Some(1));

        let totals = report.totals();
        assert_eq!(totals.timeouts, 3);
        assert_eq!(totals.interests_sent, 15);
        assert_eq!(totals.retransmissions(), 3);
    }

    #[test]
    fn empty_report() {
        let report = PlaybackReport::default();
        assert_eq!(report.mean_layers(), 0.0);
        assert_eq!(report.highest_level(), None);
    }
}
