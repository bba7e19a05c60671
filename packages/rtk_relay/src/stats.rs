use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Relay traffic counters, shared across tasks.
///
/// Writers only touch atomics; the periodic log loop reads a snapshot
/// without taking any lock.
#[derive(Debug)]
pub struct RelayStats {
    started: Instant,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    frames_decoded: AtomicU64,
    /// Milliseconds since `started` at the last ingress activity.
    last_activity_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub frames_decoded: u64,
    pub uptime: Duration,
    pub idle: Duration,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_frames(&self, n: usize) {
        self.frames_decoded.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let uptime = self.started.elapsed();
        let last_ms = self.last_activity_ms.load(Ordering::Relaxed);
        let idle = uptime.saturating_sub(Duration::from_millis(last_ms));
        StatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            uptime,
            idle,
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}
