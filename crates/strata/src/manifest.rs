// Manifest access for the adaptation policies.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, StrataError};
use crate::segment::Segment;

/// One encoding of the content. For layered content every representation is
/// one quality layer, and the ladder order is the layer order.
#[derive(Debug, Clone, Deserialize)]
pub struct Representation {
    pub id: String,
    /// Bits per second. For layered content this is cumulative over the lower layers.
    pub bandwidth: u64,
    pub segment_duration_ms: u64,
    /// Segment paths relative to the manifest base URL, in playback order.
    pub media: Vec<String>,
    /// Byte sizes per segment, when the manifest advertises them.
    #[serde(default)]
    pub sizes: Vec<u64>,
}

impl Representation {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Period {
    pub representations: Vec<Representation>,
}

/// Read-only view of the content description.
///
/// Representation indices double as quality levels: index 0 is the lowest
/// representation (the base layer of layered content).
pub trait Manifest: Send + Sync {
    fn current_period(&self) -> usize;

    fn representations(&self, period: usize) -> &[Representation];

    fn segment_uri(&self, period: usize, level: u32, number: u64) -> Option<String>;

    fn segment_duration(&self, period: usize, level: u32) -> Option<Duration> {
        self.representations(period)
            .get(level as usize)
            .map(Representation::segment_duration)
    }

    fn segment_size(&self, period: usize, level: u32, number: u64) -> Option<u64> {
        self.representations(period)
            .get(level as usize)
            .and_then(|repr| repr.sizes.get(number as usize).copied())
    }

    /// Number of segments every representation of the period can serve.
    fn total_segments(&self, period: usize) -> u64 {
        self.representations(period)
            .iter()
            .map(|repr| repr.media.len() as u64)
            .min()
            .unwrap_or(0)
    }

    /// Number of quality levels in the current period.
    fn levels(&self) -> u32 {
        self.representations(self.current_period()).len() as u32
    }

    /// Build the segment at `level` and `number` of the current period, or
    /// `None` when it lies past the end of the content.
    fn segment(&self, level: u32, number: u64) -> Option<Segment> {
        let period = self.current_period();
        if number >= self.total_segments(period) {
            return None;
        }
        let repr = self.representations(period).get(level as usize)?;
        let uri = self.segment_uri(period, level, number)?;
        let segment = Segment::new(
            uri,
            repr.segment_duration(),
            level,
            repr.bandwidth,
            repr.id.as_str(),
            number,
        );
        Some(match self.segment_size(period, level, number) {
            Some(size) => segment.with_size(size),
            None => segment,
        })
    }
}

/// Manifest held in memory, loadable from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticManifest {
    pub base_url: String,
    pub periods: Vec<Period>,
    #[serde(default)]
    pub current_period: usize,
}

impl StaticManifest {
    pub fn new(base_url: impl Into<String>, periods: Vec<Period>) -> Result<Self> {
        let mut manifest = Self {
            base_url: base_url.into(),
            periods,
            current_period: 0,
        };
        manifest.normalize()?;
        Ok(manifest)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut manifest: Self = serde_json::from_str(json)?;
        manifest.normalize()?;
        Ok(manifest)
    }

    /// Uniform content with `levels` layers of `segments` segments each.
    ///
    /// Level `l` has cumulative bandwidth `base_bandwidth * (l + 1)` and every
    /// segment carries exactly the bytes that bandwidth yields over `duration`.
    pub fn generated(
        base_url: impl Into<String>,
        levels: u32,
        segments: u64,
        duration: Duration,
        base_bandwidth: u64,
    ) -> Result<Self> {
        let duration_ms = duration.as_millis() as u64;
        let representations = (0..levels)
            .map(|level| {
                let layer_bits = base_bandwidth * duration_ms / 1000;
                Representation {
                    id: format!("L{level}"),
                    bandwidth: base_bandwidth * (u64::from(level) + 1),
                    segment_duration_ms: duration_ms,
                    media: (0..segments)
                        .map(|n| format!("L{level}/seg_{n}.svc"))
                        .collect(),
                    sizes: vec![layer_bits / 8; segments as usize],
                }
            })
            .collect();
        Self::new(base_url, vec![Period { representations }])
    }

    pub fn into_shared(self) -> Arc<dyn Manifest> {
        Arc::new(self)
    }

    fn normalize(&mut self) -> Result<()> {
        if self.periods.is_empty() {
            return Err(StrataError::manifest("manifest has no periods"));
        }
        if self.current_period >= self.periods.len() {
            return Err(StrataError::manifest(format!(
                "current period {} out of range ({} periods)",
                self.current_period,
                self.periods.len()
            )));
        }
        for (index, period) in self.periods.iter_mut().enumerate() {
            if period.representations.is_empty() {
                return Err(StrataError::manifest(format!(
                    "period {index} has no representations"
                )));
            }
            if let Some(repr) = period.representations.iter().find(|r| r.media.is_empty()) {
                return Err(StrataError::manifest(format!(
                    "representation {} of period {index} has no segments",
                    repr.id
                )));
            }
            if let Some(repr) = period
                .representations
                .iter()
                .find(|r| r.segment_duration_ms == 0)
            {
                return Err(StrataError::manifest(format!(
                    "representation {} has a zero segment duration",
                    repr.id
                )));
            }
            period.representations.sort_by_key(|r| r.bandwidth);
        }
        Ok(())
    }
}

impl Manifest for StaticManifest {
    fn current_period(&self) -> usize {
        self.current_period
    }

    fn representations(&self, period: usize) -> &[Representation] {
        self.periods
            .get(period)
            .map(|p| p.representations.as_slice())
            .unwrap_or(&[])
    }

    fn segment_uri(&self, period: usize, level: u32, number: u64) -> Option<String> {
        let repr = self.representations(period).get(level as usize)?;
        let media = repr.media.get(number as usize)?;
        if media.contains("://") || media.starts_with('/') {
            return Some(media.clone());
        }
        Some(format!("{}/{}", self.base_url.trim_end_matches('/'), media))
    }
}
