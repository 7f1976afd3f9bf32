//! Monitor statistics.
//!
//! Counters are atomics read without locks; they only ever increase for
//! the lifetime of the process. The connected/known device counts and the
//! poll-interval seconds are gauges: they track current state and move in
//! both directions.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Shared counter block updated by every monitor component.
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub polling_cycles: AtomicU64,
    pub device_state_changes: AtomicU64,
    pub probes_attempted: AtomicU64,
    pub probes_successful: AtomicU64,
    pub capability_timeouts: AtomicU64,
    pub parse_errors: AtomicU64,
    pub polling_failures: AtomicU64,
    pub udev_events_processed: AtomicU64,
    pub udev_events_filtered: AtomicU64,
    pub udev_events_skipped: AtomicU64,
    pub device_events_dropped: AtomicU64,
    /// Gauge: devices currently in `Connected` status.
    pub connected_devices: AtomicUsize,
    /// Gauge: devices currently tracked by the registry.
    pub known_devices: AtomicUsize,
    /// Gauge: current adaptive poll interval, in milliseconds.
    pub poll_interval_ms: AtomicU64,
}

impl MonitorStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_poll_interval(&self, interval: std::time::Duration) {
        self.poll_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_device_gauges(&self, connected: usize, known: usize) {
        self.connected_devices.store(connected, Ordering::Relaxed);
        self.known_devices.store(known, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            polling_cycles: self.polling_cycles.load(Ordering::Relaxed),
            device_state_changes: self.device_state_changes.load(Ordering::Relaxed),
            probes_attempted: self.probes_attempted.load(Ordering::Relaxed),
            probes_successful: self.probes_successful.load(Ordering::Relaxed),
            capability_timeouts: self.capability_timeouts.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            polling_failures: self.polling_failures.load(Ordering::Relaxed),
            udev_events_processed: self.udev_events_processed.load(Ordering::Relaxed),
            udev_events_filtered: self.udev_events_filtered.load(Ordering::Relaxed),
            udev_events_skipped: self.udev_events_skipped.load(Ordering::Relaxed),
            device_events_dropped: self.device_events_dropped.load(Ordering::Relaxed),
            connected_devices: self.connected_devices.load(Ordering::Relaxed),
            known_devices: self.known_devices.load(Ordering::Relaxed),
            current_poll_interval_secs: self.poll_interval_ms.load(Ordering::Relaxed) as f64
                / 1000.0,
        }
    }
}

/// Point-in-time copy of the statistics, safe to serialize and ship.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub polling_cycles: u64,
    pub device_state_changes: u64,
    pub probes_attempted: u64,
    pub probes_successful: u64,
    pub capability_timeouts: u64,
    pub parse_errors: u64,
    pub polling_failures: u64,
    pub udev_events_processed: u64,
    pub udev_events_filtered: u64,
    pub udev_events_skipped: u64,
    pub device_events_dropped: u64,
    pub connected_devices: usize,
    pub known_devices: usize,
    pub current_poll_interval_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = MonitorStats::default();
        MonitorStats::incr(&stats.polling_cycles);
        MonitorStats::incr(&stats.polling_cycles);
        MonitorStats::incr(&stats.probes_attempted);
        stats.set_device_gauges(2, 5);
        stats.set_poll_interval(Duration::from_millis(1500));

        let snap = stats.snapshot();
        assert_eq!(snap.polling_cycles, 2);
        assert_eq!(snap.probes_attempted, 1);
        assert_eq!(snap.connected_devices, 2);
        assert_eq!(snap.known_devices, 5);
        assert!((snap.current_poll_interval_secs - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = MonitorStats::default();
        let json = serde_json::to_value(stats.snapshot()).expect("serialize");
        assert!(json.get("polling_cycles").is_some());
        assert!(json.get("current_poll_interval_secs").is_some());
    }
}
