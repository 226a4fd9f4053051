//! JSON-RPC boundary of the load generator.
//!
//! Workers and the tracker only see [`StressRpc`]; the ethers-backed
//! implementation speaks WebSocket (with head subscriptions) or HTTP
//! (polling only). A [`Dialer`] produces fresh connections so that the
//! connection manager can retry and count them.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ethers::prelude::*;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::transaction::TransactionArgs;

const HEAD_BUFFER: usize = 64;

/// What the node knows about a transaction hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    NotFound,
    Pending,
    Included { block: u64, gas: u64 },
}

/// A transaction seen in a block body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludedTx {
    pub hash: TxHash,
    pub gas: u64,
}

#[async_trait]
pub trait StressRpc: Send + Sync {
    /// `eth_sendTransaction`: the node signs with an unlocked account.
    async fn send_transaction(&self, args: &TransactionArgs) -> Result<TxHash>;

    /// `eth_sendTransactionAsync`: the hash arrives later on the callback URL.
    async fn send_transaction_async(&self, args: &TransactionArgs) -> Result<()>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash>;

    /// `eth_sendRawPrivateTransaction(raw, {privateFor})`
    async fn send_raw_private_transaction(
        &self,
        raw: Bytes,
        private_for: &[String],
    ) -> Result<TxHash>;

    async fn chain_id(&self) -> Result<u64>;

    async fn block_number(&self) -> Result<u64>;

    async fn transaction_status(&self, hash: TxHash) -> Result<TxStatus>;

    async fn block_transactions(&self, number: u64) -> Result<Vec<IncludedTx>>;

    async fn balance(&self, address: Address) -> Result<U256>;

    async fn transaction_count(&self, address: Address, pending: bool) -> Result<u64>;

    /// New head numbers. The receiver closes when the subscription dies.
    async fn subscribe_heads(&self) -> Result<mpsc::Receiver<u64>>;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn dial(&self) -> Result<Arc<dyn StressRpc>>;
}

/// Transports that may or may not push new heads.
#[async_trait]
pub trait HeadSource: JsonRpcClient + Clone + 'static {
    async fn head_stream(provider: Provider<Self>) -> Result<mpsc::Receiver<u64>>;
}

#[async_trait]
impl HeadSource for Ws {
    async fn head_stream(provider: Provider<Self>) -> Result<mpsc::Receiver<u64>> {
        let (tx, rx) = mpsc::channel(HEAD_BUFFER);
        let (subscribed_tx, subscribed_rx) = oneshot::channel();

        tokio::spawn(async move {
            let stream = match provider.subscribe_blocks().await {
                Ok(stream) => {
                    let _ = subscribed_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = subscribed_tx.send(Err(e));
                    return;
                }
            };
            futures::pin_mut!(stream);

            while let Some(block) = stream.next().await {
                let Some(number) = block.number else {
                    continue;
                };
                if tx.send(number.as_u64()).await.is_err() {
                    break;
                }
            }
            debug!("Head subscription stream ended");
        });

        match subscribed_rx.await {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(e)) => Err(e).context("eth_subscribe newHeads failed"),
            Err(_) => bail!("head subscription task ended before subscribing"),
        }
    }
}

#[async_trait]
impl HeadSource for Http {
    async fn head_stream(_provider: Provider<Self>) -> Result<mpsc::Receiver<u64>> {
        bail!("HTTP transport cannot subscribe to new heads")
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrivateArgs<'a> {
    private_for: &'a [String],
}

pub struct EthersRpc<P: JsonRpcClient> {
    provider: Provider<P>,
}

impl<P: JsonRpcClient> EthersRpc<P> {
    pub fn new(provider: Provider<P>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P: HeadSource> StressRpc for EthersRpc<P> {
    async fn send_transaction(&self, args: &TransactionArgs) -> Result<TxHash> {
        let hash = self
            .provider
            .request("eth_sendTransaction", [args])
            .await?;
        Ok(hash)
    }

    async fn send_transaction_async(&self, args: &TransactionArgs) -> Result<()> {
        let _: serde_json::Value = self
            .provider
            .request("eth_sendTransactionAsync", [args])
            .await?;
        Ok(())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash> {
        let hash = self
            .provider
            .request("eth_sendRawTransaction", [raw])
            .await?;
        Ok(hash)
    }

    async fn send_raw_private_transaction(
        &self,
        raw: Bytes,
        private_for: &[String],
    ) -> Result<TxHash> {
        let hash = self
            .provider
            .request(
                "eth_sendRawPrivateTransaction",
                (raw, PrivateArgs { private_for }),
            )
            .await?;
        Ok(hash)
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(self.provider.get_chainid().await?.low_u64())
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn transaction_status(&self, hash: TxHash) -> Result<TxStatus> {
        let status = match self.provider.get_transaction(hash).await? {
            None => TxStatus::NotFound,
            Some(tx) => match tx.block_number {
                Some(block) => TxStatus::Included {
                    block: block.as_u64(),
                    gas: tx.gas.low_u64(),
                },
                None => TxStatus::Pending,
            },
        };
        Ok(status)
    }

    async fn block_transactions(&self, number: u64) -> Result<Vec<IncludedTx>> {
        let block = self.provider.get_block_with_txs(number).await?;
        Ok(block
            .map(|b| {
                b.transactions
                    .iter()
                    .map(|tx| IncludedTx {
                        hash: tx.hash,
                        gas: tx.gas.low_u64(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        Ok(self.provider.get_balance(address, None).await?)
    }

    async fn transaction_count(&self, address: Address, pending: bool) -> Result<u64> {
        let block = if pending {
            BlockNumber::Pending
        } else {
            BlockNumber::Latest
        };
        let count = self
            .provider
            .get_transaction_count(address, Some(block.into()))
            .await?;
        Ok(count.low_u64())
    }

    async fn subscribe_heads(&self) -> Result<mpsc::Receiver<u64>> {
        P::head_stream(self.provider.clone()).await
    }
}

/// Dials `ws://`/`wss://` endpoints over WebSocket and `http://`/`https://` over HTTP.
#[derive(Debug, Clone)]
pub struct EthersDialer {
    url: String,
}

impl EthersDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Dialer for EthersDialer {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn dial(&self) -> Result<Arc<dyn StressRpc>> {
        let parsed = url::Url::parse(&self.url).context("Invalid RPC URL")?;
        match parsed.scheme() {
            "ws" | "wss" => {
                let provider = Provider::<Ws>::connect(self.url.as_str())
                    .await
                    .with_context(|| format!("Failed to connect to {}", self.url))?;
                Ok(Arc::new(EthersRpc::new(provider)))
            }
            "http" | "https" => {
                let provider = Provider::<Http>::try_from(self.url.as_str())?;
                Ok(Arc::new(EthersRpc::new(provider)))
            }
            other => bail!("Unsupported RPC scheme '{}'", other),
        }
    }
}
