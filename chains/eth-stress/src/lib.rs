//! # eth-stress
//!
//! Floods an Ethereum JSON-RPC endpoint with transactions from a bounded
//! pool of workers and tracks every submitted hash until it is included.
//!
//! ## Modules
//!
//! - [`config`] - `StressConfig` loading and transaction kind resolution
//! - [`rpc`] - JSON-RPC boundary (`StressRpc`, `Dialer`) over ethers
//! - [`nonce_manager`] - Per-account nonce sequencers
//! - [`connection`] - Retrying dialer with counted connection guards
//! - [`spammer`] - Dispatch worker pool and submission strategies
//! - [`tracker`] - Confirmation tracker and live stats
//! - [`gateway`] - Callback receiver for `eth_sendTransactionAsync`
//! - [`payload_manager`] - Transaction manager client for private payloads
//! - [`stress`] - Wiring of one run

pub mod config;
pub mod connection;
pub mod gateway;
pub mod nonce_manager;
pub mod payload_manager;
pub mod rpc;
pub mod spammer;
pub mod stress;
pub mod tracker;
pub mod transaction;

pub use config::{StressConfig, TransactionKind};
pub use stress::{RunReport, StressRun};
