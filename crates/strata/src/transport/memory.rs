// In-process content producer serving chunk requests over channel faces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

use super::{ChannelFace, FaceEndpoint, Interest, NackReason, Reply, ReplyKind};
use crate::manifest::Manifest;
use crate::segment::content_name;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// One-way delay added to every reply.
    pub latency_ms: u64,
    /// Uniform random extra delay in `[0, jitter_ms)`.
    pub jitter_ms: u64,
    pub max_chunk_payload: usize,
    /// Bottleneck bitrate per face; replies queue behind each other when set.
    pub link_bitrate_bps: Option<u64>,
    /// Probability that an interest is silently dropped.
    pub loss_rate: f64,
    /// Probability that an interest is answered with a congestion NACK.
    pub congestion_nack_rate: f64,
    /// Levels at or above this one are rejected.
    pub reject_from_level: Option<u32>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            latency_ms: 20,
            jitter_ms: 0,
            max_chunk_payload: 4096,
            link_bitrate_bps: None,
            loss_rate: 0.0,
            congestion_nack_rate: 0.0,
            reject_from_level: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Content {
    size: u64,
    level: u32,
}

/// Serves the segments of a catalog, chunk 0 carrying the segment length as a
/// big-endian `u32` and chunks `1..` carrying the payload.
#[derive(Debug, Clone)]
pub struct ContentProducer {
    catalog: Arc<HashMap<String, Content>>,
    config: Arc<ProducerConfig>,
}

impl ContentProducer {
    pub fn new(config: ProducerConfig) -> Self {
        Self {
            catalog: Arc::new(HashMap::new()),
            config: Arc::new(config),
        }
    }

    /// Publish every segment of the manifest's current period.
    ///
    /// Segments without an advertised size get `bandwidth * duration` bytes.
    pub fn from_manifest(manifest: &dyn Manifest, config: ProducerConfig) -> Self {
        let mut producer = Self::new(config);
        let period = manifest.current_period();
        for level in 0..manifest.levels() {
            for number in 0..manifest.total_segments(period) {
                if let Some(segment) = manifest.segment(level, number) {
                    let size = segment.size().unwrap_or_else(|| {
                        segment.bandwidth() * segment.duration().as_millis() as u64 / 8_000
                    });
                    producer.insert(segment.uri(), size, level);
                }
            }
        }
        producer
    }

    pub fn insert(&mut self, uri: &str, size: u64, level: u32) {
        Arc::make_mut(&mut self.catalog).insert(content_name(uri), Content { size, level });
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Deterministic answer to `interest`; `None` means no reply at all.
    pub fn respond(&self, interest: &Interest) -> Option<ReplyKind> {
        let content = self.catalog.get(interest.name.prefix.as_ref())?;
        if self
            .config
            .reject_from_level
            .is_some_and(|level| content.level >= level)
        {
            return Some(ReplyKind::Nack(NackReason::Rejected));
        }

        let chunk = u64::from(interest.name.chunk);
        if chunk == 0 {
            let Ok(length) = u32::try_from(content.size) else {
                warn!(
                    name = %interest.name,
                    size = content.size,
                    "segment length does not fit the metadata chunk"
                );
                return Some(ReplyKind::Nack(NackReason::Rejected));
            };
            let mut meta = BytesMut::with_capacity(4);
            meta.put_u32(length);
            return Some(ReplyKind::Data(meta.freeze()));
        }

        let payload = self.config.max_chunk_payload as u64;
        let offset = (chunk - 1) * payload;
        if offset >= content.size {
            return None;
        }
        let len = payload.min(content.size - offset) as usize;
        Some(ReplyKind::Data(Bytes::from(vec![0u8; len])))
    }

    /// Create a face whose interests are served by this producer.
    pub fn connect(&self) -> ChannelFace {
        let (face, endpoint) = ChannelFace::pair();
        self.serve(endpoint);
        face
    }

    /// Serve `endpoint` until its face is dropped.
    pub fn serve(&self, mut endpoint: FaceEndpoint) -> JoinHandle<()> {
        let producer = self.clone();
        tokio::spawn(async move {
            let mut link_free_at = Instant::now();
            while let Some(interest) = endpoint.interests.recv().await {
                let Some(kind) = producer.react(&interest) else {
                    trace!(name = %interest.name, "interest dropped");
                    continue;
                };

                let mut delay = producer.delay();
                if let (Some(bps), ReplyKind::Data(payload)) =
                    (producer.config.link_bitrate_bps, &kind)
                {
                    let now = Instant::now();
                    let transmit =
                        Duration::from_secs_f64(payload.len() as f64 * 8.0 / bps as f64);
                    link_free_at = link_free_at.max(now) + transmit;
                    delay += link_free_at - now;
                }

                let replies = endpoint.replies.clone();
                let reply = Reply {
                    name: interest.name,
                    kind,
                };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = replies.send(reply);
                });
            }
        })
    }

    fn react(&self, interest: &Interest) -> Option<ReplyKind> {
        let mut rng = rand::rng();
        if self.config.loss_rate > 0.0 && rng.random_bool(self.config.loss_rate.min(1.0)) {
            return None;
        }
        if self.config.congestion_nack_rate > 0.0
            && rng.random_bool(self.config.congestion_nack_rate.min(1.0))
        {
            return Some(ReplyKind::Nack(NackReason::Congestion));
        }
        self.respond(interest)
    }

    fn delay(&self) -> Duration {
        let jitter = if self.config.jitter_ms > 0 {
            rand::rng().random_range(0..self.config.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.config.latency_ms + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChunkName, Face};

    fn interest(prefix: &str, chunk: u32) -> Interest {
        Interest {
            name: ChunkName::new(prefix, chunk),
            lifetime: Duration::from_secs(1),
            nonce: 1,
        }
    }

    fn producer(config: ProducerConfig) -> ContentProducer {
        let mut producer = ContentProducer::new(config);
        producer.insert("http://host/L0/seg_0", 10_000, 0);
        producer.insert("http://host/L2/seg_0", 10_000, 2);
        producer
    }

    #[test]
    fn metadata_chunk_carries_length() {
        let producer = producer(ProducerConfig::default());
        let reply = producer.respond(&interest("/host/L0/seg_0", 0));
        assert_eq!(
            reply,
            Some(ReplyKind::Data(Bytes::copy_from_slice(
                &10_000u32.to_be_bytes()
            )))
        );
    }

    #[test]
    fn oversized_segment_is_rejected_not_truncated() {
        let mut producer = producer(ProducerConfig::default());
        producer.insert("http://host/L1/seg_0", u64::from(u32::MAX) + 1, 1);
        assert_eq!(
            producer.respond(&interest("/host/L1/seg_0", 0)),
            Some(ReplyKind::Nack(NackReason::Rejected))
        );
        assert!(matches!(
            producer.respond(&interest("/host/L0/seg_0", 0)),
            Some(ReplyKind::Data(_))
        ));
    }

    #[test]
    fn data_chunks_split_the_payload() {
        let producer = producer(ProducerConfig::default());
        let sizes: Vec<_> = (1..=4)
            .map(|chunk| match producer.respond(&interest("/host/L0/seg_0", chunk)) {
                Some(ReplyKind::Data(payload)) => Some(payload.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![Some(4096), Some(4096), Some(1808), None]);
        assert_eq!(producer.respond(&interest("/host/unknown", 0)), None);
    }

    #[test]
    fn upper_levels_can_be_rejected() {
        let producer = producer(ProducerConfig {
            reject_from_level: Some(1),
            ..ProducerConfig::default()
        });
        assert_eq!(
            producer.respond(&interest("/host/L2/seg_0", 1)),
            Some(ReplyKind::Nack(NackReason::Rejected))
        );
        assert!(matches!(
            producer.respond(&interest("/host/L0/seg_0", 1)),
            Some(ReplyKind::Data(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn replies_arrive_after_latency() {
        let producer = producer(ProducerConfig {
            latency_ms: 30,
            ..ProducerConfig::default()
        });
        let mut face = producer.connect();
        let start = Instant::now();
        assert!(face.express_interest(interest("/host/L0/seg_0", 0)));

        let reply = face.recv().await.unwrap();
        assert_eq!(reply.name, ChunkName::new("/host/L0/seg_0", 0));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
