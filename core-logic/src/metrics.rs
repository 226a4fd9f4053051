use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of rate samples kept for the moving average.
pub const THROUGHPUT_WINDOW: usize = 10;

/// Process-wide counters, updated lock-free by workers and the tracker.
#[derive(Debug, Default)]
pub struct LoadCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    confirmed: AtomicU64,
    open_connections: AtomicU64,
}

impl LoadCounters {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_confirmed(&self) {
        self.confirmed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_opened(&self) {
        self.open_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .open_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::SeqCst)
    }
}

/// Bounded FIFO of per-tick rate samples.
#[derive(Debug, Clone, Default)]
pub struct ThroughputWindow {
    samples: VecDeque<f64>,
}

impl ThroughputWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample, evicting the oldest beyond the bound, and return the new average.
    pub fn push(&mut self, sample: f64) -> f64 {
        self.samples.push_back(sample);
        while self.samples.len() > THROUGHPUT_WINDOW {
            self.samples.pop_front();
        }
        self.average()
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Running min/avg/max of confirmation latency.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    count: u64,
    sum_ms: u64,
    min_ms: Option<u64>,
    max_ms: u64,
}

impl LatencyStats {
    pub fn record(&mut self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        self.count += 1;
        self.sum_ms = self.sum_ms.saturating_add(ms);
        self.min_ms = Some(self.min_ms.map_or(ms, |m| m.min(ms)));
        self.max_ms = self.max_ms.max(ms);
    }

    pub fn snapshot(&self) -> LatencyMetrics {
        LatencyMetrics {
            samples: self.count,
            avg_ms: if self.count > 0 {
                self.sum_ms as f64 / self.count as f64
            } else {
                0.0
            },
            min_ms: self.min_ms.unwrap_or(0),
            max_ms: self.max_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyMetrics {
    pub samples: u64,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

/// One aggregated stats event, emitted once per tracker tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub timestamp: String,
    pub sent_total: u64,
    pub failed_total: u64,
    pub confirmed_total: u64,
    pub pending: u64,
    pub stuck: u64,
    pub sent_per_sec: f64,
    pub confirmed_per_sec: f64,
    pub confirmed_per_sec_avg: f64,
    pub block_number: u64,
    pub open_connections: u64,
    pub latency: LatencyMetrics,
}

impl StatsSnapshot {
    pub fn stamped(mut self) -> Self {
        self.timestamp = Utc::now().to_rfc3339();
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub async fn export_to_file(&self, path: &str) -> std::io::Result<()> {
        tokio::fs::write(path, self.to_json()).await
    }
}

/// Rate over `elapsed`, zero for an empty interval.
pub fn per_second(delta: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        delta as f64 / secs
    } else {
        0.0
    }
}
