// Segment: the unit of work handed from adaptation to the download pool.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

/// Prefix replaced when mapping a URI onto a content name.
const HTTP_SCHEME: &str = "http://";

/// Map a segment URI onto its content name.
///
/// Content networks address data by hierarchical names, so a leading `http://`
/// is replaced by `/` (`http://host/a.svc` becomes `/host/a.svc`). Other URIs are
/// used as they are.
pub fn content_name(uri: &str) -> String {
    match uri.strip_prefix(HTTP_SCHEME) {
        Some(rest) => format!("/{rest}"),
        None => uri.to_string(),
    }
}

/// One time interval of one representation (or layer) of the content.
///
/// Segments are immutable once created; clones share the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    uri: Arc<str>,
    size: Option<u64>,
    duration: Duration,
    level: u32,
    bandwidth: u64,
    representation: Arc<str>,
    number: u64,
}

impl Segment {
    pub fn new(
        uri: impl Into<Arc<str>>,
        duration: Duration,
        level: u32,
        bandwidth: u64,
        representation: impl Into<Arc<str>>,
        number: u64,
    ) -> Self {
        Self {
            uri: uri.into(),
            size: None,
            duration,
            level,
            bandwidth,
            representation: representation.into(),
            number,
        }
    }

    /// Attach the byte size advertised by the manifest.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Byte size, if known before the first response.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Quality level, 0 is the base layer.
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    pub fn representation(&self) -> &str {
        &self.representation
    }

    /// Playback sequence number within the current period.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Name under which the chunks of this segment are requested.
    pub fn name_prefix(&self) -> String {
        content_name(&self.uri)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@L{}", self.representation, self.number, self.level)
    }
}

/// Counters of one chunked transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub interests_sent: u64,
    pub data_received: u64,
    pub duplicates: u64,
    pub timeouts: u64,
    pub nacks: u64,
}

impl TransferStats {
    /// Interests that were sent again after a timeout or NACK.
    pub fn retransmissions(&self) -> u64 {
        self.interests_sent.saturating_sub(self.data_received)
    }
}

/// A layer that finished downloading, with its payload.
#[derive(Debug, Clone)]
pub struct CompletedSegment {
    pub segment: Segment,
    pub bytes: Bytes,
    pub started: Instant,
    pub elapsed: Duration,
    pub stats: TransferStats,
}

impl CompletedSegment {
    /// Observed goodput of the transfer in bits per second.
    pub fn throughput_bps(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= f64::EPSILON {
            return u64::MAX;
        }
        ((self.bytes.len() as f64 * 8.0) / secs) as u64
    }
}
