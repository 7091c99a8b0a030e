//! Windowed chunked transfer of a single segment.
//!
//! A segment is fetched as a metadata chunk (chunk 0, the total byte length)
//! followed by fixed-size data chunks. The number of data chunks is guessed
//! until chunk 0 arrives. Requests are paced at `1 / window` seconds and the
//! number of outstanding requests is bounded by the congestion window. Every
//! request arms a retransmission timer; timeouts and congestion NACKs put the
//! chunk back in line and shrink the window, at most once per RTO.
//!
//! The downloader is driven by [`Downloader::next_event`], which must be polled
//! while a download is running: it processes replies, timer expirations and
//! pacing ticks on the caller's task and returns once there is something for
//! the owner to react to.

pub mod chunk;
pub mod rtt;
pub mod window;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::time::{Instant, Sleep};
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, trace, warn};

use self::chunk::{Arrival, ChunkStatus, ChunkTable};
use self::rtt::RttEstimator;
use self::window::CongestionWindow;
use crate::config::DownloaderConfig;
use crate::error::{Result, StrataError};
use crate::events::DownloadEvent;
use crate::segment::{CompletedSegment, Segment, TransferStats};
use crate::transport::{ChunkName, Face, Interest, NackReason, Reply, ReplyKind};

/// Delay before the first pacing tick of a new download.
const FIRST_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloaderState {
    Idle,
    Downloading,
    Finished,
    Aborted,
}

/// Per-segment transfer state, dropped on reset.
struct Transfer {
    segment: Segment,
    prefix: Arc<str>,
    chunks: ChunkTable,
    /// Starts at -1; chunk 0 adds `length + 1` and data chunks subtract their size.
    remaining: i64,
    parts: BTreeMap<u32, Bytes>,
    started: Instant,
    stats: TransferStats,
    soon_finished: bool,
}

pub struct Downloader {
    id: usize,
    face: Box<dyn Face>,
    config: Arc<DownloaderConfig>,
    window: Option<CongestionWindow>,
    rtt: RttEstimator,
    state: DownloaderState,
    transfer: Option<Transfer>,
    timers: DelayQueue<u32>,
    timer_keys: HashMap<u32, delay_queue::Key>,
    pacing: Option<Pin<Box<Sleep>>>,
    last_congestion: Option<Instant>,
    last_increase: Option<Instant>,
    events: VecDeque<DownloadEvent>,
    completed: Option<CompletedSegment>,
    face_closed: bool,
}

impl Downloader {
    pub fn new(id: usize, face: Box<dyn Face>, config: Arc<DownloaderConfig>) -> Self {
        let window = CongestionWindow::new(&config.window, config.max_chunk_payload);
        let rtt = RttEstimator::new(config.rtt.clone());
        Self {
            id,
            face,
            config,
            window: Some(window),
            rtt,
            state: DownloaderState::Idle,
            transfer: None,
            timers: DelayQueue::new(),
            timer_keys: HashMap::new(),
            pacing: None,
            last_congestion: None,
            last_increase: None,
            events: VecDeque::new(),
            completed: None,
            face_closed: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> DownloaderState {
        self.state
    }

    /// Segment of the current (or last) transfer.
    pub fn segment(&self) -> Option<&Segment> {
        self.transfer.as_ref().map(|t| &t.segment)
    }

    pub fn stats(&self) -> Option<TransferStats> {
        self.transfer.as_ref().map(|t| t.stats)
    }

    pub fn chunk_count(&self) -> Option<usize> {
        self.transfer.as_ref().map(|t| t.chunks.len())
    }

    pub fn chunk_status(&self, chunk: u32) -> Option<ChunkStatus> {
        self.transfer.as_ref().and_then(|t| t.chunks.status(chunk))
    }

    pub fn window(&self) -> Option<&CongestionWindow> {
        self.window.as_ref()
    }

    /// Hand this downloader the pool's congestion window.
    pub fn install_window(&mut self, window: CongestionWindow) {
        self.window = Some(window);
    }

    /// Give the congestion window back to the pool.
    pub fn release_window(&mut self) -> Option<CongestionWindow> {
        self.window.take()
    }

    pub fn is_busy(&self) -> bool {
        self.state == DownloaderState::Downloading
    }

    pub fn download_finished(&self) -> bool {
        self.state == DownloaderState::Finished
    }

    pub fn was_successful(&self) -> bool {
        self.state == DownloaderState::Finished
    }

    /// Take the finished segment. Must happen before the next `download`.
    pub fn take_completed(&mut self) -> Option<CompletedSegment> {
        self.completed.take()
    }

    /// Start fetching `segment`. Returns false while another download runs.
    pub fn download(&mut self, segment: Segment) -> bool {
        if self.is_busy() {
            return false;
        }
        if self.window.is_none() {
            self.window = Some(CongestionWindow::new(
                &self.config.window,
                self.config.max_chunk_payload,
            ));
        }
        self.clear_transfer();

        let prefix: Arc<str> = segment.name_prefix().into();
        debug!(
            downloader = self.id,
            name = %prefix,
            segment = %segment,
            "download started"
        );
        self.transfer = Some(Transfer {
            segment,
            prefix,
            chunks: ChunkTable::new(self.config.initial_chunk_guess as usize),
            remaining: -1,
            parts: BTreeMap::new(),
            started: Instant::now(),
            stats: TransferStats::default(),
            soon_finished: false,
        });
        self.state = DownloaderState::Downloading;

        self.request(0);
        self.pacing = Some(Box::pin(tokio::time::sleep(FIRST_TICK)));
        true
    }

    /// Cancel every timer and mark all chunks that have not arrived as aborted.
    pub fn abort_download(&mut self) {
        self.cancel_timers();
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.chunks.abort_all();
        }
        if self.state == DownloaderState::Downloading {
            debug!(downloader = self.id, "download aborted");
            self.state = DownloaderState::Aborted;
        }
    }

    /// Drop all per-segment state. The congestion window and the RTT estimate
    /// are kept.
    pub fn reset(&mut self) {
        self.clear_transfer();
        self.state = DownloaderState::Idle;
    }

    /// Drive the transfer until the next event.
    ///
    /// Pending forever when nothing is downloading. Cancel safe.
    pub async fn next_event(&mut self) -> Result<DownloadEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }
            if self.face_closed {
                return Err(StrataError::FaceClosed { face: self.id });
            }
            if self.state != DownloaderState::Downloading {
                return std::future::pending().await;
            }

            tokio::select! {
                biased;

                reply = self.face.recv() => match reply {
                    Some(reply) => self.on_reply(reply),
                    None => self.face_closed = true,
                },
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    let chunk = expired.into_inner();
                    self.timer_keys.remove(&chunk);
                    self.on_timeout(chunk);
                }
                _ = tick(&mut self.pacing) => {
                    self.pacing = None;
                    self.on_tick();
                }
            }
        }
    }

    fn clear_transfer(&mut self) {
        self.cancel_timers();
        self.rtt.clear_sent();
        self.transfer = None;
        self.completed = None;
        self.events.clear();
    }

    fn cancel_timers(&mut self) {
        self.timers.clear();
        self.timer_keys.clear();
        self.pacing = None;
    }

    fn cancel_timer(&mut self, chunk: u32) {
        if let Some(key) = self.timer_keys.remove(&chunk) {
            self.timers.try_remove(&key);
        }
    }

    /// Send an interest for `chunk` and arm its retransmission timer.
    fn request(&mut self, chunk: u32) {
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        let attempts = transfer.chunks.attempts(chunk);
        if let Some(limit) = self.config.chunk_retry_limit
            && attempts > limit
        {
            warn!(
                downloader = self.id,
                chunk,
                attempts,
                segment = %transfer.segment,
                "chunk retry limit exceeded, giving up on segment"
            );
            self.reject();
            return;
        }
        if !transfer.chunks.mark_requested(chunk) {
            return;
        }

        let timer = self.rtt.timer();
        let now = Instant::now();
        self.rtt.sent(chunk, now);
        let key = self.timers.insert(chunk, timer);
        if let Some(stale) = self.timer_keys.insert(chunk, key) {
            self.timers.try_remove(&stale);
        }
        transfer.stats.interests_sent += 1;

        let interest = Interest {
            name: ChunkName::new(transfer.prefix.clone(), chunk),
            lifetime: timer,
            nonce: rand::random(),
        };
        trace!(
            downloader = self.id,
            name = %interest.name,
            timer_ms = timer.as_millis() as u64,
            "interest sent"
        );
        if !self.face.express_interest(interest) {
            self.face_closed = true;
        }
    }

    /// Arm the pacing timer for the next request, or signal that every chunk
    /// has been requested.
    fn schedule_next(&mut self) {
        if self.state != DownloaderState::Downloading || self.pacing.is_some() {
            return;
        }
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        if transfer.chunks.next_needed().is_none() {
            if !transfer.soon_finished {
                transfer.soon_finished = true;
                self.events.push_back(DownloadEvent::SoonFinished);
            }
            return;
        }
        let interval = self
            .window
            .as_ref()
            .map_or(FIRST_TICK, CongestionWindow::pacing_interval);
        self.pacing = Some(Box::pin(tokio::time::sleep(interval)));
    }

    fn on_tick(&mut self) {
        let Some(transfer) = self.transfer.as_ref() else {
            return;
        };
        let window = self.window.as_ref().map_or(1, CongestionWindow::size) as usize;
        if transfer.chunks.in_flight() >= window {
            // Resumed by the next reply or timeout.
            return;
        }
        if let Some(chunk) = transfer.chunks.next_needed() {
            self.request(chunk);
        }
        self.schedule_next();
    }

    fn on_reply(&mut self, reply: Reply) {
        if self.state != DownloaderState::Downloading {
            return;
        }
        let Some(transfer) = self.transfer.as_ref() else {
            return;
        };
        if reply.name.prefix != transfer.prefix {
            trace!(downloader = self.id, name = %reply.name, "stale reply ignored");
            return;
        }
        let chunk = reply.name.chunk;
        match reply.kind {
            ReplyKind::Data(payload) => self.on_data(chunk, payload),
            ReplyKind::Nack(NackReason::Congestion) => self.on_congestion_nack(chunk),
            ReplyKind::Nack(NackReason::Rejected) => {
                if transfer.chunks.status(chunk) != Some(ChunkStatus::Requested) {
                    trace!(downloader = self.id, name = %reply.name, "stale rejection ignored");
                    return;
                }
                debug!(downloader = self.id, name = %reply.name, "request rejected");
                self.reject();
            }
        }
    }

    fn on_data(&mut self, chunk: u32, payload: Bytes) {
        let now = Instant::now();
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };

        if chunk == 0 && payload.len() < 4 {
            if transfer.chunks.mark_timeout(0) {
                warn!(
                    downloader = self.id,
                    len = payload.len(),
                    "malformed metadata chunk, retrying"
                );
                transfer.stats.timeouts += 1;
                self.cancel_timer(0);
                self.schedule_next();
            }
            return;
        }

        match transfer.chunks.mark_received(chunk) {
            Arrival::Duplicate => {
                transfer.stats.duplicates += 1;
                warn!(downloader = self.id, chunk, "duplicate data");
                return;
            }
            Arrival::Ignored => {
                trace!(downloader = self.id, chunk, "data for unrequested chunk ignored");
                return;
            }
            Arrival::New { .. } => {}
        }
        transfer.stats.data_received += 1;

        if chunk == 0 {
            let length = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            transfer.remaining += i64::from(length) + 1;
            let payload_size = self.config.max_chunk_payload as u64;
            let count = u64::from(length).div_ceil(payload_size) as usize + 1;
            let dropped = transfer.chunks.resize(count);
            debug!(downloader = self.id, length, chunks = count, "metadata received");
            for stale in dropped {
                self.cancel_timer(stale);
            }
        } else {
            transfer.remaining -= payload.len() as i64;
            transfer.parts.insert(chunk, payload);
        }

        self.cancel_timer(chunk);
        self.rtt.ack(chunk, now);
        self.grow_window(now);

        let finished = self.transfer.as_ref().is_some_and(|t| t.remaining == 0);
        if finished {
            self.finish(now);
        } else {
            self.schedule_next();
        }
    }

    fn on_timeout(&mut self, chunk: u32) {
        let now = Instant::now();
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        if !transfer.chunks.mark_timeout(chunk) {
            return;
        }
        transfer.stats.timeouts += 1;
        trace!(downloader = self.id, chunk, "chunk timed out");

        self.shrink_window(now);
        self.rtt.increase_multiplier();
        self.schedule_next();
    }

    fn on_congestion_nack(&mut self, chunk: u32) {
        let now = Instant::now();
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        if !transfer.chunks.mark_timeout(chunk) {
            return;
        }
        transfer.stats.nacks += 1;
        trace!(downloader = self.id, chunk, "congestion nack");

        self.cancel_timer(chunk);
        self.shrink_window(now);
        self.rtt.increase_multiplier();
        self.schedule_next();
    }

    /// AIMD decrease, at most once per RTO.
    fn shrink_window(&mut self, now: Instant) {
        let rto = self.rtt.rto();
        if self
            .last_congestion
            .is_some_and(|at| now.saturating_duration_since(at) <= rto)
        {
            return;
        }
        self.last_congestion = Some(now);
        let in_flight = self.transfer.as_ref().map_or(0, |t| t.chunks.in_flight());
        if let Some(window) = self.window.as_mut() {
            window.decrease();
            window.set_threshold(in_flight as u32);
        }
    }

    /// AIMD increase, at most once per RTO and never within one RTO of congestion.
    fn grow_window(&mut self, now: Instant) {
        let rto = self.rtt.rto();
        let within =
            |at: Option<Instant>| at.is_some_and(|at| now.saturating_duration_since(at) <= rto);
        if within(self.last_increase) || within(self.last_congestion) {
            return;
        }
        self.last_increase = Some(now);
        if let Some(window) = self.window.as_mut() {
            window.increase();
        }
    }

    fn finish(&mut self, now: Instant) {
        self.cancel_timers();
        let Some(transfer) = self.transfer.as_ref() else {
            return;
        };
        let total = transfer.parts.values().map(Bytes::len).sum();
        let mut bytes = BytesMut::with_capacity(total);
        for part in transfer.parts.values() {
            bytes.extend_from_slice(part);
        }
        let elapsed = now.saturating_duration_since(transfer.started);
        debug!(
            downloader = self.id,
            segment = %transfer.segment,
            bytes = bytes.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            retransmissions = transfer.stats.retransmissions(),
            "download finished"
        );
        self.completed = Some(CompletedSegment {
            segment: transfer.segment.clone(),
            bytes: bytes.freeze(),
            started: transfer.started,
            elapsed,
            stats: transfer.stats,
        });
        self.state = DownloaderState::Finished;
        self.events.push_back(DownloadEvent::Finished);
    }

    fn reject(&mut self) {
        self.abort_download();
        self.events.push_back(DownloadEvent::Rejected);
    }
}

async fn tick(pacing: &mut Option<Pin<Box<Sleep>>>) {
    match pacing {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
