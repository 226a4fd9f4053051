#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use eth_stress::rpc::{Dialer, IncludedTx, StressRpc, TxStatus};
use eth_stress::transaction::TransactionArgs;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TxHash, U256};
use ethers::utils::keccak256;
use ethers::utils::rlp::Rlp;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// Well-known dev key (hardhat account #0)
pub const KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const FROM: &str = "0xed9d02e382b34818e88b88a309c7fe71e65f419d";
pub const CHAIN_ID: u64 = 1337;
pub const TX_GAS: u64 = 21_000;

#[derive(Default)]
struct ChainState {
    block: u64,
    included: HashMap<TxHash, u64>,
    blocks: HashMap<u64, Vec<TxHash>>,
    held: Vec<TxHash>,
    raw_nonces: Vec<u64>,
    unsigned: u64,
    pending_count: u64,
    callbacks: Vec<String>,
    head_subscribers: Vec<mpsc::Sender<u64>>,
}

/// In-memory node: every accepted transaction is mined into its own block
/// unless the chain is holding.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
    failing_sends: AtomicU32,
    holding: AtomicBool,
    heads: bool,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_heads() -> Arc<Self> {
        Arc::new(Self {
            heads: true,
            ..Default::default()
        })
    }

    /// The next `n` submissions are rejected.
    pub fn fail_next_sends(&self, n: u32) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Accept transactions without mining them.
    pub fn hold(&self) {
        self.holding.store(true, Ordering::SeqCst);
    }

    pub fn raw_nonces(&self) -> Vec<u64> {
        let mut nonces = self.state.lock().unwrap().raw_nonces.clone();
        nonces.sort_unstable();
        nonces
    }

    pub fn unsigned_sent(&self) -> u64 {
        self.state.lock().unwrap().unsigned
    }

    pub fn accepted(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.included.len() + state.held.len()
    }

    pub fn callbacks(&self) -> Vec<String> {
        self.state.lock().unwrap().callbacks.clone()
    }

    /// Mines `hash` into a new block and announces the head.
    pub async fn mine(&self, hash: TxHash) {
        let (number, subscribers) = {
            let mut state = self.state.lock().unwrap();
            let number = Self::include(&mut state, hash);
            (number, state.head_subscribers.clone())
        };
        for subscriber in subscribers {
            let _ = subscriber.send(number).await;
        }
    }

    /// Ends every head subscription.
    pub fn close_heads(&self) {
        self.state.lock().unwrap().head_subscribers.clear();
    }

    fn include(state: &mut ChainState, hash: TxHash) -> u64 {
        state.block += 1;
        let number = state.block;
        state.included.insert(hash, number);
        state.blocks.entry(number).or_default().push(hash);
        number
    }

    fn accept(&self, hash: TxHash) -> Result<()> {
        if self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("insufficient funds for gas * price + value");
        }
        let mut state = self.state.lock().unwrap();
        if self.holding.load(Ordering::SeqCst) {
            state.held.push(hash);
        } else {
            Self::include(&mut state, hash);
        }
        Ok(())
    }

    fn next_unsigned_hash(&self) -> TxHash {
        let mut state = self.state.lock().unwrap();
        state.unsigned += 1;
        TxHash::from_low_u64_be(0xface_0000 + state.unsigned)
    }
}

#[async_trait]
impl StressRpc for MockChain {
    async fn send_transaction(&self, _args: &TransactionArgs) -> Result<TxHash> {
        let hash = self.next_unsigned_hash();
        self.accept(hash)?;
        Ok(hash)
    }

    async fn send_transaction_async(&self, args: &TransactionArgs) -> Result<()> {
        let callback_url = args
            .callback_url
            .clone()
            .ok_or_else(|| anyhow!("missing callbackUrl"))?;
        let hash = self.next_unsigned_hash();
        self.accept(hash)?;
        self.state.lock().unwrap().callbacks.push(callback_url.clone());

        tokio::spawn(async move {
            let _ = reqwest::Client::new()
                .post(callback_url)
                .json(&serde_json::json!({ "id": "1", "txHash": format!("{:?}", hash) }))
                .send()
                .await;
        });
        Ok(())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash> {
        let (tx, _signature) = TypedTransaction::decode_signed(&Rlp::new(&raw))?;
        let nonce = tx.nonce().map(|n| n.as_u64()).unwrap_or_default();
        let hash = TxHash::from(keccak256(&raw));
        self.accept(hash)?;

        let mut state = self.state.lock().unwrap();
        state.raw_nonces.push(nonce);
        state.pending_count = state.pending_count.max(nonce + 1);
        Ok(hash)
    }

    async fn send_raw_private_transaction(
        &self,
        raw: Bytes,
        _private_for: &[String],
    ) -> Result<TxHash> {
        self.send_raw_transaction(raw).await
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(CHAIN_ID)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().block)
    }

    async fn transaction_status(&self, hash: TxHash) -> Result<TxStatus> {
        let state = self.state.lock().unwrap();
        Ok(match state.included.get(&hash) {
            Some(block) => TxStatus::Included {
                block: *block,
                gas: TX_GAS,
            },
            None if state.held.contains(&hash) => TxStatus::Pending,
            None => TxStatus::NotFound,
        })
    }

    async fn block_transactions(&self, number: u64) -> Result<Vec<IncludedTx>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .blocks
            .get(&number)
            .map(|hashes| {
                hashes
                    .iter()
                    .map(|hash| IncludedTx {
                        hash: *hash,
                        gas: TX_GAS,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn balance(&self, _address: Address) -> Result<U256> {
        Ok(U256::exp10(18))
    }

    async fn transaction_count(&self, _address: Address, _pending: bool) -> Result<u64> {
        Ok(self.state.lock().unwrap().pending_count)
    }

    async fn subscribe_heads(&self) -> Result<mpsc::Receiver<u64>> {
        if !self.heads {
            bail!("HTTP transport cannot subscribe to new heads");
        }
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().unwrap().head_subscribers.push(tx);
        Ok(rx)
    }
}

/// Hands out the shared [`MockChain`]. After the first `healthy` dials
/// succeed, the next `failures` dials are refused.
pub struct MockDialer {
    chain: Arc<MockChain>,
    healthy: u32,
    failures: AtomicU32,
    dials: AtomicU32,
}

impl MockDialer {
    /// Refuses the first `failures` dials.
    pub fn new(chain: Arc<MockChain>, failures: u32) -> Arc<Self> {
        Self::failing_after(chain, 0, failures)
    }

    pub fn failing_after(chain: Arc<MockChain>, healthy: u32, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            chain,
            healthy,
            failures: AtomicU32::new(failures),
            dials: AtomicU32::new(0),
        })
    }

    pub fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    fn endpoint(&self) -> &str {
        "ws://mock.local:8546"
    }

    async fn dial(&self) -> Result<Arc<dyn StressRpc>> {
        let dial = self.dials.fetch_add(1, Ordering::SeqCst);
        if dial >= self.healthy
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            bail!("connection refused");
        }
        let rpc: Arc<dyn StressRpc> = self.chain.clone();
        Ok(rpc)
    }
}

/// Polls `condition` every few milliseconds until it holds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
