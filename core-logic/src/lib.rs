//! # Core Logic - Shared Utilities for the Load Generator
//!
//! This crate provides the chain-agnostic pieces of a transaction flood run:
//! typed errors, run configuration, retry/backoff, budget and rate limiting,
//! counters and throughput statistics, logging and shutdown handling.
//!
//! ## Modules
//!
//! - [`config`] - Run configuration shared by chain implementations
//! - [`error`] - Typed error handling with thiserror
//! - [`metrics`] - Counters, throughput window and stats snapshots
//! - [`utils`] - Retry, budget, rate limiting, logger, shutdown runner

// Module declarations - internal modules marked pub(crate)
pub mod config;
pub mod error;
pub mod metrics;
pub(crate) mod utils;

// Selective exports - only public API types
pub use config::{ConfirmationMode, SpamConfig, TrackerConfig};
pub use error::{
    ConfigError, DispatchError, NetworkError, NonceError, PayloadError, TrackerError,
};
pub use metrics::{
    per_second, LatencyMetrics, LatencyStats, LoadCounters, StatsSnapshot, ThroughputWindow,
    THROUGHPUT_WINDOW,
};

// Utils are pub(crate) - only export specific public utilities
pub use utils::{
    arm_force_exit, listen_for_shutdown, setup_logger, TokenBucket, TxBudget, STRESS_TARGET,
};

// Export retry utilities for testing
pub use utils::retry::{is_transient_error, with_retry, RetryConfig, RetryError};
