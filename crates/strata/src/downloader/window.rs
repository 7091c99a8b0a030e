//! Congestion window shared by the downloaders of one pool.
//!
//! The window bounds how many chunk requests a downloader keeps outstanding.
//! Its size always stays within `[1, receiver_window]`, where the receiver
//! window is derived from the physical link bitrate.

use std::time::Duration;

use tracing::debug;

use crate::config::{WindowConfig, WindowPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionWindow {
    policy: WindowPolicy,
    size: u32,
    threshold: u32,
    receiver_window: u32,
}

impl CongestionWindow {
    /// Derive the window for chunks of `max_chunk_payload` bytes.
    pub fn new(config: &WindowConfig, max_chunk_payload: usize) -> Self {
        let packet_bits = ((max_chunk_payload + config.packet_overhead) as u64).max(1) * 8;
        let receiver_window =
            (config.link_bitrate_bps / packet_bits).clamp(1, u64::from(u32::MAX)) as u32;
        let size = config
            .initial_window
            .unwrap_or(receiver_window)
            .clamp(1, receiver_window);

        Self {
            policy: config.policy,
            size,
            threshold: (receiver_window / 2).max(1),
            receiver_window,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn receiver_window(&self) -> u32 {
        self.receiver_window
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    /// Slow start below the threshold, additive increase above it.
    pub fn increase(&mut self) {
        if self.policy == WindowPolicy::Static {
            return;
        }
        let grown = if self.size < self.threshold {
            self.size.saturating_mul(2)
        } else {
            self.size.saturating_add(1)
        };
        self.size = grown.min(self.receiver_window);
        debug!(size = self.size, threshold = self.threshold, "window increased");
    }

    /// Multiplicative decrease.
    pub fn decrease(&mut self) {
        if self.policy == WindowPolicy::Static {
            return;
        }
        self.size = (self.size / 2).max(1);
        debug!(size = self.size, threshold = self.threshold, "window decreased");
    }

    pub fn set_threshold(&mut self, threshold: u32) {
        if self.policy == WindowPolicy::Static {
            return;
        }
        self.threshold = threshold.clamp(1, self.receiver_window);
    }

    /// Spacing between two scheduling decisions: one window per second.
    pub fn pacing_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(policy: WindowPolicy, initial: Option<u32>) -> WindowConfig {
        WindowConfig {
            policy,
            link_bitrate_bps: 10_000_000,
            packet_overhead: 50,
            initial_window: initial,
        }
    }

    #[test]
    fn receiver_window_from_link_bitrate() {
        let window = CongestionWindow::new(&config(WindowPolicy::Aimd, None), 4096);
        // 10 Mbit/s over (4096 + 50) byte packets.
        assert_eq!(window.receiver_window(), 301);
        assert_eq!(window.size(), 301);
        assert_eq!(window.threshold(), 150);
    }

    #[test]
    fn slow_start_then_linear_growth() {
        let mut window = CongestionWindow::new(&config(WindowPolicy::Aimd, Some(4)), 4096);
        window.set_threshold(10);

        window.increase();
        assert_eq!(window.size(), 8);
        window.increase();
        assert_eq!(window.size(), 16);
        window.increase();
        assert_eq!(window.size(), 17);
    }

    #[test]
    fn size_stays_within_bounds() {
        let mut window = CongestionWindow::new(&config(WindowPolicy::Aimd, Some(2)), 4096);
        for _ in 0..5 {
            window.decrease();
        }
        assert_eq!(window.size(), 1);

        for _ in 0..1000 {
            window.increase();
        }
        assert_eq!(window.size(), window.receiver_window());
    }

    #[test]
    fn static_window_ignores_feedback() {
        let mut window = CongestionWindow::new(&config(WindowPolicy::Static, Some(12)), 4096);
        window.decrease();
        window.increase();
        window.set_threshold(1);
        assert_eq!(window.size(), 12);
        assert_eq!(window.threshold(), 150);
    }

    #[test]
    fn pacing_shrinks_with_window() {
        let window = CongestionWindow::new(&config(WindowPolicy::Aimd, Some(4)), 4096);
        assert_eq!(window.pacing_interval(), Duration::from_millis(250));
    }
}
