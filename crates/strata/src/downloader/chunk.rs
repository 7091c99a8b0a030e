// Per-chunk status bookkeeping of one segment transfer.

use std::fmt;

/// Status of one chunk of the segment in flight.
///
/// `NotInitiated -> Requested -> {Received | Timeout | Aborted}`, where
/// `Timeout` may be requested again and `Received` never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    NotInitiated,
    Requested,
    Received,
    Timeout,
    Aborted,
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotInitiated => "not-initiated",
            Self::Requested => "requested",
            Self::Received => "received",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Outcome of a data arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// First arrival; `was_requested` tells whether the chunk was still in flight.
    New { was_requested: bool },
    Duplicate,
    /// The chunk was never requested, is aborted or unknown.
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkTable {
    status: Vec<ChunkStatus>,
    attempts: Vec<u32>,
    in_flight: usize,
}

impl ChunkTable {
    pub fn new(len: usize) -> Self {
        Self {
            status: vec![ChunkStatus::NotInitiated; len],
            attempts: vec![0; len],
            in_flight: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.status.len()
    }

    pub fn status(&self, chunk: u32) -> Option<ChunkStatus> {
        self.status.get(chunk as usize).copied()
    }

    /// Number of chunks currently `Requested`.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// How often `chunk` was requested.
    pub fn attempts(&self, chunk: u32) -> u32 {
        self.attempts.get(chunk as usize).copied().unwrap_or(0)
    }

    /// Lowest chunk that still has to be requested.
    pub fn next_needed(&self) -> Option<u32> {
        self.status
            .iter()
            .position(|s| matches!(s, ChunkStatus::NotInitiated | ChunkStatus::Timeout))
            .map(|i| i as u32)
    }

    pub fn mark_requested(&mut self, chunk: u32) -> bool {
        let i = chunk as usize;
        match self.status.get(i) {
            Some(ChunkStatus::NotInitiated | ChunkStatus::Timeout) => {
                self.status[i] = ChunkStatus::Requested;
                self.attempts[i] += 1;
                self.in_flight += 1;
                true
            }
            _ => false,
        }
    }

    /// Timeouts and NACKs only apply to chunks still in flight.
    pub fn mark_timeout(&mut self, chunk: u32) -> bool {
        let i = chunk as usize;
        if self.status.get(i) != Some(&ChunkStatus::Requested) {
            return false;
        }
        self.status[i] = ChunkStatus::Timeout;
        self.in_flight -= 1;
        true
    }

    pub fn mark_received(&mut self, chunk: u32) -> Arrival {
        let i = chunk as usize;
        match self.status.get(i) {
            Some(ChunkStatus::Received) => Arrival::Duplicate,
            Some(ChunkStatus::Requested) => {
                self.status[i] = ChunkStatus::Received;
                self.in_flight -= 1;
                Arrival::New {
                    was_requested: true,
                }
            }
            Some(ChunkStatus::Timeout) => {
                self.status[i] = ChunkStatus::Received;
                Arrival::New {
                    was_requested: false,
                }
            }
            _ => Arrival::Ignored,
        }
    }

    /// Resize to `len` chunks. Returns the chunks dropped while in flight.
    pub fn resize(&mut self, len: usize) -> Vec<u32> {
        let dropped: Vec<u32> = self
            .status
            .iter()
            .enumerate()
            .skip(len)
            .filter(|(_, s)| **s == ChunkStatus::Requested)
            .map(|(i, _)| i as u32)
            .collect();
        self.in_flight -= dropped.len();
        self.status.resize(len, ChunkStatus::NotInitiated);
        self.attempts.resize(len, 0);
        dropped
    }

    /// Mark every chunk that has not arrived as aborted.
    pub fn abort_all(&mut self) {
        for status in &mut self.status {
            if *status != ChunkStatus::Received {
                *status = ChunkStatus::Aborted;
            }
        }
        self.in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_then_receive() {
        let mut table = ChunkTable::new(3);
        assert_eq!(table.next_needed(), Some(0));
        assert!(table.mark_requested(0));
        assert!(!table.mark_requested(0));
        assert_eq!(table.in_flight(), 1);
        assert_eq!(table.next_needed(), Some(1));

        assert_eq!(
            table.mark_received(0),
            Arrival::New {
                was_requested: true
            }
        );
        assert_eq!(table.mark_received(0), Arrival::Duplicate);
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn received_is_terminal() {
        let mut table = ChunkTable::new(1);
        table.mark_requested(0);
        table.mark_received(0);

        assert!(!table.mark_timeout(0));
        assert!(!table.mark_requested(0));
        table.abort_all();
        assert_eq!(table.status(0), Some(ChunkStatus::Received));
    }

    #[test]
    fn timeout_is_retried() {
        let mut table = ChunkTable::new(2);
        table.mark_requested(0);
        table.mark_requested(1);

        assert!(table.mark_timeout(0));
        assert!(!table.mark_timeout(0));
        assert_eq!(table.in_flight(), 1);
        assert_eq!(table.next_needed(), Some(0));

        assert!(table.mark_requested(0));
        assert_eq!(table.attempts(0), 2);

        // Late data for a timed out chunk still counts.
        table.mark_timeout(1);
        assert_eq!(
            table.mark_received(1),
            Arrival::New {
                was_requested: false
            }
        );
    }

    #[test]
    fn never_requested_chunks_are_ignored() {
        let mut table = ChunkTable::new(2);
        assert_eq!(table.mark_received(1), Arrival::Ignored);
        assert_eq!(table.mark_received(7), Arrival::Ignored);
        assert!(!table.mark_timeout(1));
    }

    #[test]
    fn resize_reports_dropped_requests() {
        let mut table = ChunkTable::new(10);
        for chunk in 0..5 {
            table.mark_requested(chunk);
        }

        let dropped = table.resize(3);
        assert_eq!(dropped, vec![3, 4]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.in_flight(), 3);

        assert!(table.resize(6).is_empty());
        assert_eq!(table.next_needed(), Some(3));
    }

    #[test]
    fn abort_marks_everything_not_received() {
        let mut table = ChunkTable::new(4);
        table.mark_requested(0);
        table.mark_received(0);
        table.mark_requested(1);
        table.mark_requested(2);
        table.mark_timeout(2);

        table.abort_all();
        let statuses: Vec<_> = (0..4).filter_map(|chunk| table.status(chunk)).collect();
        assert_eq!(
            statuses,
            vec![
                ChunkStatus::Received,
                ChunkStatus::Aborted,
                ChunkStatus::Aborted,
                ChunkStatus::Aborted,
            ]
        );
        assert_eq!(table.in_flight(), 0);
        assert_eq!(table.next_needed(), None);
    }
}
