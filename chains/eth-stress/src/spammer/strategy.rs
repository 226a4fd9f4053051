use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use core_logic::DispatchError;
use ethers::prelude::*;
use std::sync::Arc;

use crate::payload_manager::PayloadDistributor;
use crate::rpc::StressRpc;
use crate::transaction::TransactionArgs;

/// How a worker turns the transaction template into a submission.
/// Selected once at startup.
pub enum SubmissionStrategy {
    /// The node signs with an unlocked `from` account.
    Unsigned,
    /// Like `Unsigned`, the hash is delivered later to `callback_url`.
    Async { callback_url: String },
    /// Signed locally (EIP-155) with a sequenced nonce.
    Signed { wallet: LocalWallet },
    /// Payload stored on the transaction managers, the key signed locally
    /// with a sequenced nonce.
    Private {
        wallet: LocalWallet,
        distributor: Arc<PayloadDistributor>,
    },
}

impl SubmissionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unsigned => "unsigned",
            Self::Async { .. } => "async",
            Self::Signed { .. } => "signed",
            Self::Private { .. } => "private",
        }
    }

    pub fn needs_nonce(&self) -> bool {
        matches!(self, Self::Signed { .. } | Self::Private { .. })
    }

    /// Whether the hash returned by [`submit`](Self::submit) goes to the tracker.
    pub fn publishes(&self) -> bool {
        !matches!(self, Self::Async { .. })
    }

    /// Submits one transaction. Returns the hash when it is known synchronously.
    pub async fn submit(
        &self,
        rpc: &dyn StressRpc,
        template: &TransactionArgs,
        nonce: Option<u64>,
    ) -> Result<Option<TxHash>, DispatchError> {
        match self {
            Self::Unsigned => rpc
                .send_transaction(template)
                .await
                .map(Some)
                .map_err(rejected("eth_sendTransaction")),
            Self::Async { callback_url } => {
                let args = template.clone().with_callback(callback_url.as_str());
                rpc.send_transaction_async(&args)
                    .await
                    .map(|_| None)
                    .map_err(rejected("eth_sendTransactionAsync"))
            }
            Self::Signed { wallet } => {
                let nonce = require_nonce(nonce, "eth_sendRawTransaction")?;
                let raw = template
                    .sign(wallet, nonce)
                    .map_err(rejected("eth_sendRawTransaction"))?;
                rpc.send_raw_transaction(raw)
                    .await
                    .map(Some)
                    .map_err(rejected("eth_sendRawTransaction"))
            }
            Self::Private {
                wallet,
                distributor,
            } => {
                let nonce = require_nonce(nonce, "eth_sendRawPrivateTransaction")?;
                let key = distributor
                    .distribute_payload(&BASE64.encode(&template.data))
                    .await?;
                let key = BASE64.decode(key.as_bytes()).map_err(|e| {
                    DispatchError::SubmissionRejected {
                        method: "storeraw".to_string(),
                        reason: format!("key is not base64: {}", e),
                    }
                })?;
                let raw = template
                    .sign_private(wallet, nonce, Bytes::from(key))
                    .map_err(rejected("eth_sendRawPrivateTransaction"))?;
                rpc.send_raw_private_transaction(raw, &template.private_for)
                    .await
                    .map(Some)
                    .map_err(rejected("eth_sendRawPrivateTransaction"))
            }
        }
    }
}

fn rejected(method: &'static str) -> impl Fn(anyhow::Error) -> DispatchError {
    move |e| DispatchError::SubmissionRejected {
        method: method.to_string(),
        reason: format!("{:#}", e),
    }
}

fn require_nonce(nonce: Option<u64>, method: &'static str) -> Result<u64, DispatchError> {
    nonce.ok_or_else(|| DispatchError::SubmissionRejected {
        method: method.to_string(),
        reason: "no nonce allocated".to_string(),
    })
}
