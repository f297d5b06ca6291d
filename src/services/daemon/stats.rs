use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Счётчики демона, читаются из других задач
#[derive(Debug, Default)]
pub struct DaemonStats {
    events: AtomicU64,
    resolutions: AtomicU64,
    commands: AtomicU64,
    unclassified: AtomicU64,
    reconnects: AtomicU64,
    detections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events: u64,
    pub resolutions: u64,
    pub commands: u64,
    pub unclassified: u64,
    pub reconnects: u64,
    pub detections: u64,
}

impl DaemonStats {
    pub fn event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resolution(&self) {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commands_sent(&self, count: usize) {
        self.commands.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn unclassified(&self) {
        self.unclassified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn detection(&self) {
        self.detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            resolutions: self.resolutions.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            unclassified: self.unclassified.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
        }
    }
}

/// Экспоненциальная задержка переподключения с верхней границей
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Текущая задержка; следующая будет вдвое больше
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = DaemonStats::default();
        stats.event();
        stats.commands_sent(2);
        stats.reconnect();
        let snap = stats.snapshot();
        assert_eq!((snap.events, snap.commands, snap.reconnects), (1, 2, 1));
    }
}
