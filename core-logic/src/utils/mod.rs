//! # Utilities Module
//!
//! Internal utility modules for the core-logic crate.
//! These modules are marked as `pub(crate)` to enforce API boundaries.

// Internal modules - not part of public API
pub(crate) mod budget;
pub(crate) mod logger;
pub(crate) mod rate_limiter;
pub(crate) mod retry;
pub(crate) mod runner;

// Selective exports - only public utilities
pub use budget::TxBudget;
pub use logger::{setup_logger, STRESS_TARGET};
pub use rate_limiter::TokenBucket;
pub use runner::{arm_force_exit, listen_for_shutdown};
