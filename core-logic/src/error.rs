//! # Core Error Types
//!
//! Centralized error definitions for the load generator.
//! All errors implement `std::error::Error` and `std::fmt::Display`.
//!
//! Propagation follows one rule: per-transaction failures stay local to the
//! worker that hit them, connectivity failures of the confirmation tracker
//! are global.

use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid RPC URL format: '{url}'")]
    InvalidRpcUrl { url: String },

    #[error("Missing required configuration field: '{field}'")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Conflicting configuration: {reason}")]
    Conflict { reason: String },
}

/// Network and RPC connectivity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Every dial attempt failed. Fatal to the worker that was dialing.
    #[error("Connection to {endpoint} failed after {attempts} attempts: {reason}")]
    ConnectionExhausted {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    /// Shutdown was requested while dialing or backing off.
    #[error("Connection attempt cancelled by shutdown")]
    Cancelled,
}

/// Nonce sequencer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NonceError {
    #[error("Account {address} is already registered")]
    AlreadyRegistered { address: String },

    #[error("Account {address} is not registered")]
    UnknownAccount { address: String },

    /// A reconciliation would have moved the counter up past issued values.
    #[error("Refusing nonce refresh for {address}: observed {observed} is not below next {next}")]
    Conflict {
        address: String,
        observed: u64,
        next: u64,
    },

    #[error("Nonce sequencer for {address} is closed")]
    Closed { address: String },
}

/// Errors raised while dispatching a single transaction
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The RPC endpoint answered with an application error.
    #[error("Transaction rejected by {method}: {reason}")]
    SubmissionRejected { method: String, reason: String },

    #[error(transparent)]
    Connection(#[from] NetworkError),

    #[error(transparent)]
    Nonce(#[from] NonceError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("Dispatch cancelled by shutdown")]
    Cancelled,
}

/// Confirmation tracker errors. Any of these stops the whole run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Lost upstream connection to {endpoint}: {reason}")]
    UpstreamLost { endpoint: String, reason: String },

    #[error(transparent)]
    Connection(#[from] NetworkError),
}

/// Privacy-group payload distribution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("No transaction manager configured")]
    NoTransactionManagers,

    #[error("Transaction manager {url} request failed: {reason}")]
    Request { url: String, reason: String },

    /// Two transaction managers derived different keys for one payload.
    #[error("Key differs between transaction managers: {url} returned {got:?}, expected {expected:?}")]
    ConsistencyMismatch {
        url: String,
        got: String,
        expected: String,
    },
}
