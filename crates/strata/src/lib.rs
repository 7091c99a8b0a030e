//! Layered adaptive streaming over chunk-addressable content networks.
//!
//! This crate fetches video segments, split into fixed-size named chunks, over
//! a request/response network primitive, and decides which quality layers of
//! the next segment to fetch from the state of the playback buffer.
//!
//! ## Component Overview
//!
//! - `adaptation`: decision policies (layered three-phase search, rate-based,
//!   buffer-based, fixed quality)
//! - `buffer`: bounded playback buffer and per-layer occupancy
//! - `downloader`: one windowed chunked transfer with AIMD congestion control,
//!   retransmission timers and RTT estimation
//! - `manager`: pool of downloaders fetching the layers of one segment, with
//!   upper-layer shedding on explicit rejects
//! - `player`: the fetch, buffer and consume loop
//! - `transport`: the network face abstraction and an in-process producer
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use strata::transport::memory::{ContentProducer, ProducerConfig};
//! use strata::{Face, Player, PlayerConfig, StaticManifest};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> strata::Result<()> {
//! let manifest = StaticManifest::generated(
//!     "http://video.example/bbb",
//!     3,
//!     30,
//!     Duration::from_secs(2),
//!     600_000,
//! )?
//! .into_shared();
//! let producer = ContentProducer::from_manifest(manifest.as_ref(), ProducerConfig::default());
//!
//! let config = PlayerConfig::default();
//! let faces = (0..config.pool_size)
//!     .map(|_| Box::new(producer.connect()) as Box<dyn Face>)
//!     .collect();
//! let mut player = Player::new(config, manifest, faces)?;
//! let report = player.run(CancellationToken::new()).await?;
//! println!("{} segments, {} stalls", report.segments(), report.stalls.len());
//! # Ok(())
//! # }
//! ```

pub mod adaptation;
pub mod buffer;
pub mod config;
pub mod downloader;
pub mod error;
pub mod events;
pub mod manager;
pub mod manifest;
pub mod player;
pub mod segment;
pub mod stats;
pub mod transport;

pub use adaptation::{AdaptationKind, AdaptationLogic};
pub use buffer::{BufferState, LayerOccupancy, PlaybackBuffer};
pub use config::{
    AdaptationConfig, DownloaderConfig, PlayerConfig, PlayerConfigBuilder, RttConfig,
    WindowConfig, WindowPolicy,
};
pub use downloader::{Downloader, DownloaderState};
pub use error::{Result, StrataError};
pub use events::{DownloadEvent, ManagerEvent};
pub use manager::{DownloadManager, Salvage};
pub use manifest::{Manifest, Period, Representation, StaticManifest};
pub use player::{Player, PlayerState};
pub use segment::{CompletedSegment, Segment, TransferStats};
pub use stats::{PlaybackReport, StatsSink, TracingStats};
pub use transport::{ChannelFace, Face};
