//! Transport traffic counters and monitoring windows.

use std::sync::atomic::{AtomicU64, Ordering};

use minstant::Instant;
use parking_lot::Mutex;

use crate::trace::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub messages_received: u64,
}

impl TrafficSnapshot {
    fn delta(&self, earlier: &Self) -> Self {
        Self {
            bytes_sent: self.bytes_sent - earlier.bytes_sent,
            messages_sent: self.messages_sent - earlier.messages_sent,
            bytes_received: self.bytes_received - earlier.bytes_received,
            messages_received: self.messages_received - earlier.messages_received,
        }
    }
}

#[derive(Debug, Default)]
pub struct TransportMetrics {
    bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
    window: Mutex<Option<(Instant, TrafficSnapshot)>>,
}

impl TransportMetrics {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.window.lock().is_some()
    }

    /// Opens a monitoring window. Restarts it if one is already open.
    pub fn start_monitoring(&self) {
        *self.window.lock() = Some((Instant::now(), self.snapshot()));
        info!("transport monitoring started");
    }

    /// Closes the window and logs the traffic seen during it.
    pub fn stop_monitoring(&self) -> Option<TrafficSnapshot> {
        let Some((opened, baseline)) = self.window.lock().take() else {
            warn!("transport monitoring was not started");
            return None;
        };
        let delta = self.snapshot().delta(&baseline);
        info!(
            elapsed_ms = opened.elapsed().as_millis() as u64,
            bytes_sent = delta.bytes_sent,
            messages_sent = delta.messages_sent,
            bytes_received = delta.bytes_received,
            messages_received = delta.messages_received,
            "transport monitoring report"
        );
        Some(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reports_only_its_own_traffic() {
        let m = TransportMetrics::default();
        m.record_sent(100);
        m.start_monitoring();
        assert!(m.is_monitoring());
        m.record_sent(10);
        m.record_received(7);
        m.record_received(3);

        let delta = m.stop_monitoring().unwrap();
        assert_eq!(delta.bytes_sent, 10);
        assert_eq!(delta.messages_sent, 1);
        assert_eq!(delta.bytes_received, 10);
        assert_eq!(delta.messages_received, 2);
        assert!(!m.is_monitoring());
        assert_eq!(m.snapshot().bytes_sent, 110);
    }

    #[test]
    fn stop_without_start() {
        assert_eq!(TransportMetrics::default().stop_monitoring(), None);
    }
}
