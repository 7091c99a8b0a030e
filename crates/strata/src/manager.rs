//! Pool of downloaders fetching the layers of one playback segment.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::select_all;
use tracing::{debug, info, trace};

use crate::config::DownloaderConfig;
use crate::downloader::Downloader;
use crate::downloader::window::CongestionWindow;
use crate::error::{Result, StrataError};
use crate::events::{DownloadEvent, ManagerEvent};
use crate::segment::{CompletedSegment, Segment};
use crate::transport::Face;

/// Outcome of [`DownloadManager::retrieve_unfinished_segments`].
#[derive(Debug, Default)]
pub struct Salvage {
    /// Finished layers forming a gap-free run from the lowest level of the batch.
    pub usable: Vec<CompletedSegment>,
    /// Layers aborted, dequeued or discarded past a gap. They were never
    /// delivered and have to be requested again to be played.
    pub dropped: Vec<Segment>,
}

impl Salvage {
    pub fn is_empty(&self) -> bool {
        self.usable.is_empty() && self.dropped.is_empty()
    }
}

/// Fans the layers of a batch out over a fixed pool of downloaders.
///
/// The layers of one batch are either finished, enqueued or in flight; a layer
/// only disappears through an explicit abort (a rejection shedding the upper
/// layers, a salvage after a stall, or `stop`). The congestion window moves
/// from the most recently finished downloader to the next one that starts.
pub struct DownloadManager {
    downloaders: Vec<Downloader>,
    enqueued: VecDeque<Segment>,
    finished: Vec<CompletedSegment>,
    /// Lowest level of the batch in flight.
    batch_base: Option<u32>,
    /// Window released by the last finished downloader, not yet handed on.
    pooled: Option<CongestionWindow>,
    /// State of the most recently released window.
    last_released: Option<CongestionWindow>,
    events: VecDeque<ManagerEvent>,
}

impl DownloadManager {
    /// One downloader per face.
    pub fn new(faces: Vec<Box<dyn Face>>, config: Arc<DownloaderConfig>) -> Result<Self> {
        if faces.is_empty() {
            return Err(StrataError::configuration(
                "download manager needs at least one downloader",
            ));
        }
        let downloaders = faces
            .into_iter()
            .enumerate()
            .map(|(id, face)| Downloader::new(id, face, config.clone()))
            .collect();
        Ok(Self {
            downloaders,
            enqueued: VecDeque::new(),
            finished: Vec::new(),
            batch_base: None,
            pooled: None,
            last_released: None,
            events: VecDeque::new(),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.downloaders.len()
    }

    pub fn downloader(&self, id: usize) -> Option<&Downloader> {
        self.downloaders.get(id)
    }

    pub fn enqueued(&self) -> usize {
        self.enqueued.len()
    }

    /// No downloader busy and nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.enqueued.is_empty() && self.all_idle()
    }

    /// Queue the layers of one batch, lowest level first. They start right
    /// away when the whole pool is idle, otherwise as downloaders free up.
    pub fn enqueue(&mut self, mut segments: Vec<Segment>) {
        segments.sort_by_key(Segment::level);
        if let Some(first) = segments.first() {
            let base = first.level();
            self.batch_base = Some(self.batch_base.map_or(base, |b| b.min(base)));
        }
        trace!(layers = segments.len(), "layers enqueued");
        self.enqueued.extend(segments);
        if self.all_idle() {
            self.dispatch();
        }
    }

    /// Take the layers finished so far, ordered by level.
    pub fn retrieve_finished_segments(&mut self) -> Vec<CompletedSegment> {
        let mut finished = std::mem::take(&mut self.finished);
        finished.sort_by_key(|c| c.segment.level());
        finished
    }

    /// Salvage what is usable after a stall.
    ///
    /// When the lowest layer of the batch has not finished nothing is touched
    /// and the salvage is empty. Otherwise the finished layers forming a
    /// gap-free run from that level are returned, and every other layer of the
    /// batch is aborted and reported as dropped.
    pub fn retrieve_unfinished_segments(&mut self) -> Salvage {
        for downloader in &mut self.downloaders {
            if let Some(completed) = downloader.take_completed() {
                self.finished.push(completed);
            }
        }
        let Some(base) = self.batch_base else {
            return Salvage::default();
        };
        if !self.finished.iter().any(|c| c.segment.level() == base) {
            debug!(base, "lowest layer still in flight, nothing salvaged");
            return Salvage::default();
        }

        let mut salvage = Salvage::default();
        let mut expected = base;
        for completed in self.retrieve_finished_segments() {
            if completed.segment.level() == expected && salvage.dropped.is_empty() {
                expected += 1;
                salvage.usable.push(completed);
            } else {
                salvage.dropped.push(completed.segment);
            }
        }
        for downloader in &mut self.downloaders {
            if downloader.is_busy() {
                if let Some(segment) = downloader.segment() {
                    salvage.dropped.push(segment.clone());
                }
                downloader.abort_download();
            }
            downloader.reset();
        }
        salvage.dropped.extend(self.enqueued.drain(..));
        salvage.dropped.sort_by_key(Segment::level);
        self.batch_base = None;
        self.events.clear();
        debug!(
            usable = salvage.usable.len(),
            dropped = salvage.dropped.len(),
            "salvaged unfinished batch"
        );
        salvage
    }

    /// Abort everything.
    pub fn stop(&mut self) {
        for downloader in &mut self.downloaders {
            downloader.abort_download();
            downloader.reset();
        }
        self.enqueued.clear();
        self.finished.clear();
        self.batch_base = None;
        self.events.clear();
        info!("download manager stopped");
    }

    /// Drive all downloads until the next batch level event.
    ///
    /// Pending forever while nothing is in flight. Cancel safe.
    pub async fn next_event(&mut self) -> Result<ManagerEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }

            let polls = self.downloaders.iter_mut().enumerate().map(|(id, downloader)| {
                Box::pin(async move { (id, downloader.next_event().await) })
            });
            let (output, _, remaining) = select_all(polls).await;
            drop(remaining);

            let (id, event) = output;
            self.on_download_event(id, event?);
        }
    }

    fn on_download_event(&mut self, id: usize, event: DownloadEvent) {
        match event {
            DownloadEvent::Finished => self.on_finished(id),
            DownloadEvent::SoonFinished => self.dispatch(),
            DownloadEvent::Rejected => self.on_rejected(id),
        }
    }

    fn on_finished(&mut self, id: usize) {
        let downloader = &mut self.downloaders[id];
        if let Some(completed) = downloader.take_completed() {
            trace!(downloader = id, segment = %completed.segment, "layer finished");
            self.finished.push(completed);
        }
        if let Some(window) = downloader.release_window() {
            self.last_released = Some(window.clone());
            self.pooled = Some(window);
        }
        downloader.reset();

        self.dispatch();
        self.check_batch_complete();
    }

    /// Shed the rejected layer and every layer above it.
    fn on_rejected(&mut self, id: usize) {
        let failed = self.downloaders[id].segment().cloned();
        self.downloaders[id].reset();
        let Some(failed) = failed else {
            return;
        };
        let level = failed.level();

        let mut shed: Vec<Segment> = self.enqueued.drain(..).collect();
        for downloader in &mut self.downloaders {
            let Some(segment) = downloader.segment() else {
                continue;
            };
            // Finished layers whose event is still queued are shed as well.
            let live = downloader.is_busy() || downloader.download_finished();
            if live && segment.level() >= level {
                shed.push(segment.clone());
                downloader.abort_download();
                downloader.reset();
            }
        }
        self.finished.retain(|completed| {
            if completed.segment.level() >= level {
                shed.push(completed.segment.clone());
                false
            } else {
                true
            }
        });
        shed.sort_by_key(Segment::level);

        debug!(
            segment = %failed,
            shed = shed.len(),
            "layer rejected, shedding upper layers"
        );
        self.events.push_back(ManagerEvent::LayersShed { failed, shed });
        self.check_batch_complete();
    }

    /// Start queued layers on every free downloader.
    fn dispatch(&mut self) {
        for id in 0..self.downloaders.len() {
            if self.enqueued.is_empty() {
                break;
            }
            if self.downloaders[id].is_busy() {
                continue;
            }
            let Some(segment) = self.enqueued.pop_front() else {
                break;
            };
            let window = self.lease_window();
            let downloader = &mut self.downloaders[id];
            downloader.reset();
            if let Some(window) = window {
                downloader.install_window(window);
            }
            trace!(downloader = id, segment = %segment, "layer dispatched");
            downloader.download(segment);
        }
    }

    /// The pooled window if nobody holds it, otherwise a copy of the most
    /// recently released state.
    fn lease_window(&mut self) -> Option<CongestionWindow> {
        self.pooled.take().or_else(|| self.last_released.clone())
    }

    fn all_idle(&self) -> bool {
        self.downloaders.iter().all(|d| !d.is_busy())
    }

    fn check_batch_complete(&mut self) {
        if self.enqueued.is_empty() && self.all_idle() {
            self.batch_base = None;
            self.events.push_back(ManagerEvent::BatchComplete);
        }
    }
}
