use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chain-agnostic knobs of one load-generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamConfig {
    pub rpc_url: String,
    /// Dial attempts per connection, and reconnection cycles per worker.
    pub retry: u32,
    pub backoff_base_ms: u64,
    pub max_open_connection: u64,
    pub max_transaction: u64,
    pub target_tps: Option<u32>,
    pub tracker: TrackerConfig,
    /// Time allowed for unwinding after shutdown before the process exits.
    pub grace_period_ms: u64,
}

impl SpamConfig {
    /// Number of concurrent workers: one per connection, never more than transactions.
    pub fn worker_count(&self) -> u64 {
        self.max_open_connection.min(self.max_transaction)
    }
}

/// How the tracker learns about inclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationMode {
    /// Subscribe to new heads when the transport allows it, poll otherwise.
    #[default]
    Auto,
    Subscription,
    Polling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub mode: ConfirmationMode,
    pub tick_interval_ms: u64,
    pub stuck_threshold_ms: u64,
    /// Subscription mode only: poll records pending longer than this.
    pub recheck_after_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            mode: ConfirmationMode::Auto,
            tick_interval_ms: 1000,
            stuck_threshold_ms: 300_000,
            recheck_after_ms: 10_000,
        }
    }
}

impl TrackerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_millis(self.stuck_threshold_ms)
    }

    pub fn recheck_after(&self) -> Duration {
        Duration::from_millis(self.recheck_after_ms)
    }
}
