use anyhow::{Context, Result};
use config::{Config, Environment, File};
use core_logic::config::{ConfirmationMode, SpamConfig, TrackerConfig};
use core_logic::ConfigError;
use ethers::prelude::*;
use serde::Deserialize;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::transaction::{parse_payload, TransactionArgs};

pub const DEFAULT_CONFIG_PATH: &str = "chains/eth-stress/config.toml";

/// Hex private key, wiped from memory on drop and never printed.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn wallet(&self) -> Result<LocalWallet> {
        self.0
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .context("Invalid private key")
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(***)")
    }
}

/// Submission strategy resolved from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Unsigned,
    Async,
    Signed,
    Private,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    pub rpc_url: String,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Hex encoded transaction data.
    pub payload: String,
    pub private_key: Option<PrivateKey>,
    pub private_from: Option<String>,
    pub private_for: Vec<String>,
    pub retry: u32,
    pub max_open_connection: u64,
    pub max_transaction: u64,
    pub target_tps: Option<u32>,
    #[serde(rename = "async")]
    pub async_mode: bool,
    pub async_addr: String,
    pub async_advertised_url: String,
    pub transaction_manager_urls: Vec<String>,
    pub gas: u64,
    pub gas_price: u64,
    pub value: u64,
    pub confirmation_mode: ConfirmationMode,
    pub tick_interval_ms: u64,
    pub stuck_threshold_secs: u64,
    pub recheck_after_secs: u64,
    pub backoff_base_ms: u64,
    pub grace_period_ms: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            rpc_url: "ws://127.0.0.1:8546".to_string(),
            from: None,
            to: None,
            payload: "00".to_string(),
            private_key: None,
            private_from: None,
            private_for: Vec::new(),
            retry: 3,
            max_open_connection: 1,
            max_transaction: 1,
            target_tps: None,
            async_mode: false,
            async_addr: "0.0.0.0:18547".to_string(),
            async_advertised_url: "http://localhost:18547/sendTransactionAsync".to_string(),
            transaction_manager_urls: vec!["http://127.0.0.1:9080".to_string()],
            gas: 90_000,
            gas_price: 0,
            value: 0,
            confirmation_mode: ConfirmationMode::Auto,
            tick_interval_ms: 1000,
            stuck_threshold_secs: 300,
            recheck_after_secs: 10,
            backoff_base_ms: 2000,
            grace_period_ms: 2000,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl StressConfig {
    /// Loads `path` (optional file), then environment variables such as
    /// `RPC_URL` or `MAX_TRANSACTION`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_env(path, Environment::default())
    }

    fn load_with_env(path: Option<&str>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(
                env.list_separator(",")
                    .with_list_parse_key("private_for")
                    .with_list_parse_key("transaction_manager_urls"),
            )
            .build()?;

        settings.try_deserialize().map_err(|e| anyhow::anyhow!(e))
    }

    fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref().filter(|key| !key.is_empty())
    }

    pub fn transaction_kind(&self) -> Result<TransactionKind, ConfigError> {
        let signed = self.private_key().is_some();
        if signed && self.async_mode {
            return Err(ConfigError::Conflict {
                reason: "cannot send async signed transactions".to_string(),
            });
        }
        if signed {
            return Ok(if self.private_for.is_empty() {
                TransactionKind::Signed
            } else {
                TransactionKind::Private
            });
        }
        if non_empty(&self.from).is_none() {
            return Err(ConfigError::MissingField {
                field: "from or private_key".to_string(),
            });
        }
        Ok(if self.async_mode {
            TransactionKind::Async
        } else {
            TransactionKind::Unsigned
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.rpc_url).map_err(|_| ConfigError::InvalidRpcUrl {
            url: self.rpc_url.clone(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss" | "http" | "https") {
            return Err(ConfigError::InvalidRpcUrl {
                url: self.rpc_url.clone(),
            });
        }

        if self.max_open_connection == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_open_connection".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.target_tps == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "target_tps".to_string(),
                reason: "must be at least 1 when set".to_string(),
            });
        }
        parse_payload(&self.payload).map_err(|e| ConfigError::InvalidValue {
            field: "payload".to_string(),
            reason: format!("{:#}", e),
        })?;
        for (field, value) in [("from", &self.from), ("to", &self.to)] {
            if let Some(address) = non_empty(value) {
                address.parse::<Address>().map_err(|_| ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("'{}' is not an address", address),
                })?;
            }
        }
        if let Some(key) = self.private_key() {
            key.wallet().map_err(|_| ConfigError::InvalidValue {
                field: "private_key".to_string(),
                reason: "not a hex encoded secp256k1 key".to_string(),
            })?;
        }

        match self.transaction_kind()? {
            TransactionKind::Private if self.transaction_manager_urls.is_empty() => {
                Err(ConfigError::MissingField {
                    field: "transaction_manager_urls".to_string(),
                })
            }
            TransactionKind::Async if self.async_advertised_url.trim().is_empty() => {
                Err(ConfigError::MissingField {
                    field: "async_advertised_url".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Signing wallet when a private key is configured.
    pub fn wallet(&self) -> Result<Option<LocalWallet>> {
        self.private_key().map(PrivateKey::wallet).transpose()
    }

    /// Sender address: derived from the key when signing, else `from`.
    pub fn sender(&self) -> Result<Address> {
        if let Some(wallet) = self.wallet()? {
            return Ok(wallet.address());
        }
        let from = non_empty(&self.from).ok_or_else(|| ConfigError::MissingField {
            field: "from".to_string(),
        })?;
        from.parse::<Address>()
            .with_context(|| format!("Invalid from address '{}'", from))
    }

    pub fn template(&self, from: Address) -> Result<TransactionArgs> {
        let to = non_empty(&self.to)
            .map(|to| to.parse::<Address>())
            .transpose()
            .context("Invalid to address")?;
        Ok(TransactionArgs {
            from,
            to,
            gas: U256::from(self.gas),
            gas_price: U256::from(self.gas_price),
            value: U256::from(self.value),
            data: parse_payload(&self.payload)?,
            private_from: non_empty(&self.private_from).map(str::to_string),
            private_for: self.private_for.clone(),
            callback_url: None,
        })
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            mode: self.confirmation_mode,
            tick_interval_ms: self.tick_interval_ms,
            stuck_threshold_ms: self.stuck_threshold_secs.saturating_mul(1000),
            recheck_after_ms: self.recheck_after_secs.saturating_mul(1000),
        }
    }

    pub fn to_spam_config(&self) -> SpamConfig {
        SpamConfig {
            rpc_url: self.rpc_url.clone(),
            retry: self.retry,
            backoff_base_ms: self.backoff_base_ms,
            max_open_connection: self.max_open_connection,
            max_transaction: self.max_transaction,
            target_tps: self.target_tps,
            tracker: self.tracker_config(),
            grace_period_ms: self.grace_period_ms,
        }
    }
}
