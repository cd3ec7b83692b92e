//! Outcome counters pushed after each chunk.
//!
//! The sink is optional: checks report to [`NoopMetrics`] unless given
//! something else, and pass/fail never depends on it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// A single per-chunk outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckEvent {
    Uploaded,
    Downloaded,
    Synced,
    NotSynced,
    Repaired,
    Evicted,
}

/// Receives check outcomes.
pub trait MetricsSink: Send + Sync {
    fn record(&self, check: &'static str, event: CheckEvent);

    /// Latency of an event. Ignored by default.
    fn observe(&self, check: &'static str, event: CheckEvent, elapsed: Duration) {
        let _ = (check, event, elapsed);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _check: &'static str, _event: CheckEvent) {}
}

/// In-memory counters and last observed latencies.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    counts: Mutex<HashMap<(&'static str, CheckEvent), u64>>,
    latencies: Mutex<HashMap<(&'static str, CheckEvent), Duration>>,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of `event` recorded by `check`.
    pub fn count(&self, check: &'static str, event: CheckEvent) -> u64 {
        self.counts
            .lock()
            .map(|counts| counts.get(&(check, event)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Most recent latency observed for `event`.
    pub fn last_latency(&self, check: &'static str, event: CheckEvent) -> Option<Duration> {
        self.latencies
            .lock()
            .ok()
            .and_then(|latencies| latencies.get(&(check, event)).copied())
    }
}

impl MetricsSink for CountingMetrics {
    fn record(&self, check: &'static str, event: CheckEvent) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry((check, event)).or_insert(0) += 1;
        }
    }

    fn observe(&self, check: &'static str, event: CheckEvent, elapsed: Duration) {
        if let Ok(mut latencies) = self.latencies.lock() {
            latencies.insert((check, event), elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_check_and_event() {
        let metrics = CountingMetrics::new();
        metrics.record("pushsync", CheckEvent::Uploaded);
        metrics.record("pushsync", CheckEvent::Uploaded);
        metrics.record("pullsync", CheckEvent::Uploaded);

        assert_eq!(metrics.count("pushsync", CheckEvent::Uploaded), 2);
        assert_eq!(metrics.count("pullsync", CheckEvent::Uploaded), 1);
        assert_eq!(metrics.count("pushsync", CheckEvent::Synced), 0);
    }

    #[test]
    fn latency_keeps_latest() {
        let metrics = CountingMetrics::new();
        metrics.observe("chunkrepair", CheckEvent::Repaired, Duration::from_secs(3));
        metrics.observe("chunkrepair", CheckEvent::Repaired, Duration::from_secs(7));
        assert_eq!(
            metrics.last_latency("chunkrepair", CheckEvent::Repaired),
            Some(Duration::from_secs(7))
        );
        NoopMetrics.observe("chunkrepair", CheckEvent::Repaired, Duration::ZERO);
    }
}
