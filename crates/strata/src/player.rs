//! The playback loop.
//!
//! [`Player`] asks its adaptation policy for the next batch of layers, hands it
//! to the [`DownloadManager`], credits finished batches to the playback buffer
//! and consumes the buffer at a fixed interval. Everything runs on one task:
//! downloads, retransmission timers and the consume clock are multiplexed in
//! [`Player::run`].

use std::fmt;
use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::adaptation::{self, AdaptationLogic};
use crate::buffer::{BufferState, LayerOccupancy, PlaybackBuffer};
use crate::config::PlayerConfig;
use crate::error::{Result, StrataError};
use crate::events::ManagerEvent;
use crate::manager::DownloadManager;
use crate::manifest::Manifest;
use crate::segment::CompletedSegment;
use crate::stats::{PlaybackReport, SegmentRecord, StallRecord, StatsSink, TracingStats};
use crate::transport::Face;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Stopped,
    Playing,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Playing => write!(f, "playing"),
        }
    }
}

pub struct Player {
    config: PlayerConfig,
    manifest: Arc<dyn Manifest>,
    adaptation: Box<dyn AdaptationLogic>,
    manager: DownloadManager,
    playback: PlaybackBuffer,
    layers: LayerOccupancy,
    stats: Box<dyn StatsSink>,
    state: PlayerState,
    /// Segment number of the batch in flight.
    pending: Option<u64>,
    all_downloaded: bool,
    started: Option<Instant>,
    report: PlaybackReport,
}

impl Player {
    /// Build a player with one downloader per face.
    ///
    /// The adaptation policy is resolved from `config.adaptation`; the number
    /// of faces has to match `config.pool_size`.
    pub fn new(
        config: PlayerConfig,
        manifest: Arc<dyn Manifest>,
        faces: Vec<Box<dyn Face>>,
    ) -> Result<Self> {
        config.validate()?;
        if faces.len() != config.pool_size {
            return Err(StrataError::configuration(format!(
                "expected {} faces, got {}",
                config.pool_size,
                faces.len()
            )));
        }
        let adaptation = adaptation::build(&config.adaptation, manifest.clone())?;
        let manager = DownloadManager::new(faces, Arc::new(config.downloader.clone()))?;
        Ok(Self {
            playback: PlaybackBuffer::new(config.max_buffer()),
            config,
            manifest,
            adaptation,
            manager,
            layers: LayerOccupancy::new(),
            stats: Box::new(TracingStats::new()),
            state: PlayerState::Stopped,
            pending: None,
            all_downloaded: false,
            started: None,
            report: PlaybackReport::default(),
        })
    }

    pub fn with_stats(mut self, stats: impl StatsSink + 'static) -> Self {
        self.stats = Box::new(stats);
        self
    }

    /// Replace the configured adaptation policy.
    pub fn with_adaptation(mut self, adaptation: Box<dyn AdaptationLogic>) -> Self {
        self.adaptation = adaptation;
        self
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn buffer(&self) -> &PlaybackBuffer {
        &self.playback
    }

    pub fn layers(&self) -> &LayerOccupancy {
        &self.layers
    }

    pub fn adaptation(&self) -> &dyn AdaptationLogic {
        self.adaptation.as_ref()
    }

    pub fn report(&self) -> &PlaybackReport {
        &self.report
    }

    pub fn all_downloaded(&self) -> bool {
        self.all_downloaded
    }

    /// Start playing and issue the first request.
    pub fn play(&mut self) {
        if self.state == PlayerState::Playing {
            return;
        }
        let now = Instant::now();
        self.state = PlayerState::Playing;
        self.all_downloaded = false;
        self.started = Some(now);
        self.stats.playback_started(now);
        info!(
            policy = self.adaptation.name(),
            levels = self.manifest.levels(),
            segments = self.manifest.total_segments(self.manifest.current_period()),
            "playback started"
        );
        self.streaming();
    }

    /// Stop playing and abort every download.
    pub fn stop(&mut self) {
        if self.state == PlayerState::Stopped {
            return;
        }
        self.state = PlayerState::Stopped;
        self.pending = None;
        self.manager.stop();
        self.stats.playback_stopped(Instant::now());
        info!(
            played_ms = self.report.played.as_millis() as u64,
            stalls = self.report.stalls.len(),
            "playback stopped"
        );
    }

    /// Play until the content is over or `token` is cancelled.
    ///
    /// The first consume tick fires after the initial consume delay, the rest
    /// every consume interval.
    pub async fn run(&mut self, token: CancellationToken) -> Result<PlaybackReport> {
        self.play();
        let start = Instant::now() + self.config.initial_consume_delay();
        let mut consume = interval_at(start, self.config.consume_interval());
        consume.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("playback cancelled");
                    break Err(StrataError::Cancelled);
                }
                event = self.manager.next_event() => {
                    match event {
                        Ok(event) => self.on_manager_event(event),
                        Err(e) => break Err(e),
                    }
                }
                _ = consume.tick() => {
                    if !self.consume() {
                        break Ok(());
                    }
                }
            }
        };

        self.stop();
        outcome.map(|()| std::mem::take(&mut self.report))
    }

    fn buffer_state(&self) -> BufferState<'_> {
        BufferState {
            playback: &self.playback,
            layers: &self.layers,
        }
    }

    /// Request the next batch unless one is in flight or the buffer is full.
    ///
    /// Called again after every batch and every consume tick, which are the
    /// only events that change the outcome.
    fn streaming(&mut self) {
        if self.state != PlayerState::Playing || self.pending.is_some() || self.all_downloaded {
            return;
        }

        let period = self.manifest.current_period();
        let candidate = self
            .manifest
            .segment_duration(period, 0)
            .unwrap_or_default();
        if !self.playback.has_room_for(candidate) {
            trace!(
                buffered_ms = self.playback.buffered().as_millis() as u64,
                "buffer full, waiting for playback"
            );
            return;
        }

        let batch = {
            let state = BufferState {
                playback: &self.playback,
                layers: &self.layers,
            };
            self.adaptation.next_segments(&state)
        };
        let Some(first) = batch.first() else {
            if self.adaptation.is_exhausted(&self.buffer_state()) {
                self.all_downloaded = true;
                info!("all segments downloaded");
            } else {
                trace!("nothing to request");
            }
            return;
        };

        let number = first.number();
        let level = batch.iter().map(|s| s.level()).max().unwrap_or_default();
        self.stats.segment_requested(number, level);
        debug!(number, layers = batch.len(), level, "requesting batch");
        self.pending = Some(number);
        self.manager.enqueue(batch);
    }

    fn on_manager_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::BatchComplete => {
                let finished = self.manager.retrieve_finished_segments();
                self.admit(finished);
                self.pending = None;
                self.streaming();
            }
            ManagerEvent::LayersShed { failed, shed } => {
                // The batch completes once the surviving layers are done.
                self.report.shed_layers += shed.len() + 1;
                self.adaptation.segment_failed(&failed);
            }
        }
    }

    /// Credit the finished layers of one segment.
    ///
    /// Playback time is added once per segment, and for layered content only
    /// when the base layer is among the layers.
    fn admit(&mut self, finished: Vec<CompletedSegment>) {
        let Some(first) = finished.first() else {
            return;
        };
        let number = first.segment.number();
        let duration = first.segment.duration();
        let playable =
            !self.adaptation.is_layered() || finished.iter().any(|c| c.segment.level() == 0);

        for completed in &finished {
            self.layers.record(completed.segment.level(), number);
            self.adaptation.segment_retrieved(completed);
            self.stats.segment_downloaded(completed);
            self.report.records.push(SegmentRecord::from(completed));
        }

        if !playable {
            return;
        }
        if !self.playback.has_room_for(duration) {
            warn!(
                number,
                buffered_ms = self.playback.buffered().as_millis() as u64,
                "buffer full, segment not credited"
            );
            return;
        }
        if self.layers.schedule_playout(number, duration) {
            self.playback.add_data(duration);
        }
    }

    /// One consume tick. Returns false once playback is over.
    fn consume(&mut self) -> bool {
        if self.state != PlayerState::Playing {
            return false;
        }
        if self.all_downloaded && self.playback.is_empty() {
            info!("all done");
            self.report.completed = true;
            return false;
        }

        let interval = self.config.consume_interval();
        if !self.playback.consume_data(interval) {
            if self.all_downloaded {
                // The tail is shorter than one interval.
                let rest = self.playback.drain();
                self.played(rest);
                self.report.completed = true;
                info!("all done");
                return false;
            }

            // An empty salvage leaves the batch running.
            let salvage = self.manager.retrieve_unfinished_segments();
            if !salvage.is_empty() {
                for segment in &salvage.dropped {
                    self.adaptation.segment_abandoned(segment);
                }
                self.pending = None;
                self.admit(salvage.usable);
            }

            if !self.playback.consume_data(interval) {
                let number = self.layers.last_consumed().map_or(0, |n| n + 1);
                let buffered = self.playback.buffered();
                self.stats.stall(number, buffered);
                self.report.stalls.push(StallRecord {
                    at: self.elapsed(),
                    number,
                });
                self.streaming();
                return true;
            }
        }

        self.played(interval);
        self.streaming();
        true
    }

    fn played(&mut self, time: std::time::Duration) {
        self.report.played += time;
        for number in self.layers.advance(time) {
            self.adaptation.segment_consumed(number);
        }
    }

    fn elapsed(&self) -> std::time::Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{AdaptationKind, PlayerConfigBuilder};
    use crate::manifest::StaticManifest;
    use crate::transport::memory::{ContentProducer, ProducerConfig};

    fn manifest(levels: u32, segments: u64) -> Arc<dyn Manifest> {
        StaticManifest::generated(
            "http://video.example",
            levels,
            segments,
            Duration::from_secs(2),
            40_000,
        )
        .unwrap()
        .into_shared()
    }

    fn faces(producer: &ContentProducer, count: usize) -> Vec<Box<dyn Face>> {
        (0..count)
            .map(|_| Box::new(producer.connect()) as Box<dyn Face>)
            .collect()
    }

    fn config(kind: AdaptationKind) -> PlayerConfig {
        PlayerConfigBuilder::new()
            .with_max_buffer(Duration::from_secs(60))
            .with_pool_size(2)
            .with_adaptation(kind)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn face_count_must_match_pool() {
        let manifest = manifest(2, 4);
        let producer = ContentProducer::from_manifest(manifest.as_ref(), ProducerConfig::default());
        let result = Player::new(
            config(AdaptationKind::Layered),
            manifest,
            faces(&producer, 3),
        );
        assert!(matches!(result, Err(StrataError::Configuration { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn plays_fixed_quality_to_the_end() {
        let manifest = manifest(3, 5);
        let producer = ContentProducer::from_manifest(manifest.as_ref(), ProducerConfig::default());
        let mut player = Player::new(
            config(AdaptationKind::AlwaysLowest),
            manifest,
            faces(&producer, 2),
        )
        .unwrap();

        let report = player.run(CancellationToken::new()).await.unwrap();
        assert!(report.completed);
        assert!(report.stalls.is_empty());
        assert_eq!(report.segments(), 5);
        assert_eq!(report.highest_level(), Some(0));
        assert_eq!(report.played, Duration::from_secs(10));
        assert_eq!(player.state(), PlayerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_playback() {
        let manifest = manifest(2, 50);
        let producer = ContentProducer::from_manifest(manifest.as_ref(), ProducerConfig::default());
        let mut player = Player::new(
            config(AdaptationKind::Layered),
            manifest,
            faces(&producer, 2),
        )
        .unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        let result = player.run(token).await;
        assert!(matches!(result, Err(StrataError::Cancelled)));
        assert_eq!(player.state(), PlayerState::Stopped);
        assert!(player.report().played >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_content_stalls() {
        let manifest = manifest(1, 3);
        let producer = ContentProducer::from_manifest(
            manifest.as_ref(),
            ProducerConfig {
                loss_rate: 1.0,
                ..ProducerConfig::default()
            },
        );
        let mut player = Player::new(
            config(AdaptationKind::Layered),
            manifest,
            faces(&producer, 2),
        )
        .unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4_500)).await;
            cancel.cancel();
        });

        assert!(player.run(token).await.is_err());
        // Ticks at 2s, 3s and 4s all underrun.
        let report = player.report();
        assert_eq!(report.stalls.len(), 3);
        assert!(report.stalls.iter().all(|stall| stall.number == 0));
        assert!(report.records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_layers_are_shed_and_reported() {
        let manifest = manifest(3, 6);
        let producer = ContentProducer::from_manifest(
            manifest.as_ref(),
            ProducerConfig {
                reject_from_level: Some(1),
                ..ProducerConfig::default()
            },
        );
        let mut player = Player::new(
            config(AdaptationKind::Layered),
            manifest,
            faces(&producer, 2),
        )
        .unwrap();

        let report = player.run(CancellationToken::new()).await.unwrap();
        assert!(report.completed);
        assert!(report.shed_layers > 0);
        assert_eq!(report.highest_level(), Some(0));
        assert_eq!(report.segments(), 6);
        assert!(player.adaptation().is_layered());
    }
}
