use crate::segment::Segment;

/// Notification from a downloader to its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Every byte of the segment arrived; the result is ready to be taken.
    Finished,
    /// The network refused the segment, or it ran out of retries.
    Rejected,
    /// The last chunk is requested and the transfer is draining.
    SoonFinished,
}

/// Notification from the download manager to the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// Every layer of the batch reached a terminal state.
    BatchComplete,
    /// `failed` was rejected and every layer at or above its level was dropped.
    LayersShed { failed: Segment, shed: Vec<Segment> },
}
