//! Nonce Manager - per-account sequencer actors
//!
//! Every registered address gets one task that owns its next nonce. Callers
//! never touch the counter: they send a request over the actor's mailbox and
//! wait for the reply, so issuance per address is totally ordered by mailbox
//! arrival and no value is handed out twice.
//!
//! # Reconciliation
//!
//! Workers consume nonces optimistically. When a submission fails the value
//! it held may never reach the chain, so the worker reports the account's
//! pending transaction count through [`NonceManager::refresh`]. The actor only
//! accepts values strictly below its counter; moving it up could re-issue a
//! value a caller already holds.
//!
//! # Shutdown
//!
//! Actors stop on [`NonceManager::close`] or when the parent shutdown token
//! fires. Requests still queued are dropped with the mailbox and their
//! callers get [`NonceError::Closed`].

use anyhow::Result;
use core_logic::NonceError;
use ethers::types::Address;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::rpc::StressRpc;

const MAILBOX_CAPACITY: usize = 256;

enum Command {
    Next {
        reply: oneshot::Sender<u64>,
    },
    /// Replies with the new next value, or the unchanged one on rejection.
    Refresh {
        observed: u64,
        reply: oneshot::Sender<Result<u64, u64>>,
    },
}

struct SequencerHandle {
    mailbox: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

async fn run_sequencer(
    address: Address,
    mut next: u64,
    mut mailbox: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = mailbox.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::Next { reply } => {
                // A caller that gave up does not consume a value
                if reply.send(next).is_ok() {
                    next += 1;
                }
            }
            Command::Refresh { observed, reply } => {
                let result = if observed < next {
                    next = observed;
                    Ok(next)
                } else {
                    Err(next)
                };
                let _ = reply.send(result);
            }
        }
    }

    debug!(address = ?address, next, "Nonce sequencer stopped");
}

/// Registry of nonce sequencers, one per sending account.
pub struct NonceManager {
    sequencers: RwLock<HashMap<Address, SequencerHandle>>,
    shutdown: CancellationToken,
}

impl NonceManager {
    /// Sequencers stop when `shutdown` (or a parent of it) is cancelled.
    pub fn new(shutdown: &CancellationToken) -> Self {
        Self {
            sequencers: RwLock::new(HashMap::new()),
            shutdown: shutdown.child_token(),
        }
    }

    /// Starts the sequencer for `address`, seeded with its on-chain count.
    pub async fn register(&self, address: Address, initial: u64) -> Result<(), NonceError> {
        let mut sequencers = self.sequencers.write().await;
        if sequencers.contains_key(&address) {
            return Err(NonceError::AlreadyRegistered {
                address: format!("{:?}", address),
            });
        }
        if self.shutdown.is_cancelled() {
            return Err(closed(address));
        }

        let (mailbox, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        let task = tokio::spawn(run_sequencer(
            address,
            initial,
            inbox,
            self.shutdown.clone(),
        ));
        sequencers.insert(address, SequencerHandle { mailbox, task });

        debug!(address = ?address, nonce = initial, "Nonce sequencer registered");
        Ok(())
    }

    async fn mailbox(&self, address: Address) -> Result<mpsc::Sender<Command>, NonceError> {
        self.sequencers
            .read()
            .await
            .get(&address)
            .map(|handle| handle.mailbox.clone())
            .ok_or_else(|| NonceError::UnknownAccount {
                address: format!("{:?}", address),
            })
    }

    /// Next nonce for `address`. Waits for the actor, or fails with
    /// [`NonceError::Closed`] once the manager shuts down.
    pub async fn next(&self, address: Address) -> Result<u64, NonceError> {
        let mailbox = self.mailbox(address).await?;
        let (reply, response) = oneshot::channel();

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(closed(address)),
            result = async {
                mailbox
                    .send(Command::Next { reply })
                    .await
                    .map_err(|_| closed(address))?;
                response.await.map_err(|_| closed(address))
            } => result,
        }
    }

    /// Moves the counter down to `observed`. Rejected with
    /// [`NonceError::Conflict`] when `observed` is not below the counter.
    pub async fn refresh(&self, address: Address, observed: u64) -> Result<u64, NonceError> {
        let mailbox = self.mailbox(address).await?;
        let (reply, response) = oneshot::channel();

        mailbox
            .send(Command::Refresh { observed, reply })
            .await
            .map_err(|_| closed(address))?;

        match response.await.map_err(|_| closed(address))? {
            Ok(next) => {
                debug!(address = ?address, next, "Nonce counter reconciled");
                Ok(next)
            }
            Err(next) => Err(NonceError::Conflict {
                address: format!("{:?}", address),
                observed,
                next,
            }),
        }
    }

    /// Reconciles against the account's pending transaction count.
    pub async fn refresh_from_chain(
        &self,
        address: Address,
        rpc: &dyn StressRpc,
    ) -> Result<u64> {
        let observed = rpc.transaction_count(address, true).await?;
        Ok(self.refresh(address, observed).await?)
    }

    /// Stops every sequencer and waits for them to exit.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handles: Vec<SequencerHandle> = self
            .sequencers
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        for handle in handles {
            drop(handle.mailbox);
            let _ = handle.task.await;
        }
    }
}

fn closed(address: Address) -> NonceError {
    NonceError::Closed {
        address: format!("{:?}", address),
    }
}
