//! Named request/response transport used by the downloaders.
//!
//! A downloader talks to the network through a [`Face`]: it expresses an
//! [`Interest`] for one chunk name and eventually receives at most one
//! [`Reply`] for it, either the data or an explicit NACK. Silence is a timeout
//! and is detected by the downloader itself. Replies may arrive out of order
//! and more than once.

pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Name of one chunk: `<segment name>/chunk_<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkName {
    pub prefix: Arc<str>,
    pub chunk: u32,
}

impl ChunkName {
    const SEPARATOR: &'static str = "/chunk_";

    pub fn new(prefix: impl Into<Arc<str>>, chunk: u32) -> Self {
        Self {
            prefix: prefix.into(),
            chunk,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let (prefix, chunk) = name.rsplit_once(Self::SEPARATOR)?;
        let chunk = chunk.parse().ok()?;
        Some(Self::new(prefix, chunk))
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.prefix, Self::SEPARATOR, self.chunk)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub name: ChunkName,
    /// How long the network keeps the request pending.
    pub lifetime: Duration,
    pub nonce: u32,
}

/// Why the network refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    /// Transient overload on the path; the request may be retried.
    Congestion,
    /// The network will not serve this content (e.g. the layer is shed).
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    Data(Bytes),
    Nack(NackReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub name: ChunkName,
    pub kind: ReplyKind,
}

impl Reply {
    pub fn data(name: ChunkName, payload: impl Into<Bytes>) -> Self {
        Self {
            name,
            kind: ReplyKind::Data(payload.into()),
        }
    }

    pub fn nack(name: ChunkName, reason: NackReason) -> Self {
        Self {
            name,
            kind: ReplyKind::Nack(reason),
        }
    }
}

/// One downloader's attachment to the network.
#[async_trait]
pub trait Face: Send {
    /// Send an interest. Returns false once the face is closed.
    fn express_interest(&mut self, interest: Interest) -> bool;

    /// Next reply, or `None` once the face is closed.
    ///
    /// Must be cancel safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Option<Reply>;
}

/// Face backed by in-process channels.
#[derive(Debug)]
pub struct ChannelFace {
    interests: mpsc::UnboundedSender<Interest>,
    replies: mpsc::UnboundedReceiver<Reply>,
}

/// Network side of a [`ChannelFace`].
#[derive(Debug)]
pub struct FaceEndpoint {
    pub interests: mpsc::UnboundedReceiver<Interest>,
    pub replies: mpsc::UnboundedSender<Reply>,
}

impl ChannelFace {
    pub fn pair() -> (Self, FaceEndpoint) {
        let (interest_tx, interest_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        (
            Self {
                interests: interest_tx,
                replies: reply_rx,
            },
            FaceEndpoint {
                interests: interest_rx,
                replies: reply_tx,
            },
        )
    }
}

#[async_trait]
impl Face for ChannelFace {
    fn express_interest(&mut self, interest: Interest) -> bool {
        self.interests.send(interest).is_ok()
    }

    async fn recv(&mut self) -> Option<Reply> {
        self.replies.recv().await
    }
}
