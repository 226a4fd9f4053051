//! One load-generation run.
//!
//! Startup order matters: accounts are registered with their on-chain
//! nonce, the tracker connects (and subscribes) and only then do the
//! workers start sending. The run ends when the tracker has confirmed
//! everything the workers sent, or when `shutdown` fires.

use anyhow::{Context, Result};
use core_logic::{
    LoadCounters, RetryConfig, StatsSnapshot, TokenBucket, TxBudget, STRESS_TARGET,
};
use ethers::prelude::*;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{StressConfig, TransactionKind};
use crate::connection::ConnectionManager;
use crate::gateway::AsyncGateway;
use crate::nonce_manager::NonceManager;
use crate::payload_manager::PayloadDistributor;
use crate::rpc::Dialer;
use crate::spammer::{DispatchContext, DispatchPool, SubmissionStrategy};
use crate::tracker::ConfirmationTracker;

/// Capacity of the channel between workers (or the gateway) and the tracker.
const INTAKE_CAPACITY: usize = 1024;

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub kind: TransactionKind,
    pub workers: u64,
    pub sent: u64,
    pub failed: u64,
    pub confirmed: u64,
    pub pending: u64,
    pub stuck: u64,
    pub exhausted_workers: u64,
    pub last_stats: Option<StatsSnapshot>,
}

pub struct StressRun {
    config: StressConfig,
    dialer: Arc<dyn Dialer>,
    shutdown: CancellationToken,
    latest: watch::Sender<Option<StatsSnapshot>>,
}

impl StressRun {
    pub fn new(config: StressConfig, dialer: Arc<dyn Dialer>, shutdown: CancellationToken) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            config,
            dialer,
            shutdown,
            latest,
        }
    }

    /// Most recent stats snapshot of the run, `None` before the first tick.
    pub fn latest_stats(&self) -> watch::Receiver<Option<StatsSnapshot>> {
        self.latest.subscribe()
    }

    pub async fn run(self) -> Result<RunReport> {
        let Self {
            config,
            dialer,
            shutdown,
            latest,
        } = self;

        config.validate()?;
        let kind = config.transaction_kind()?;
        let spam = config.to_spam_config();

        let counters = Arc::new(LoadCounters::default());
        let connections = Arc::new(ConnectionManager::new(
            dialer,
            RetryConfig::new(spam.retry, spam.backoff_base_ms),
            counters.clone(),
        ));
        let nonces = Arc::new(NonceManager::new(&shutdown));

        let sender = config.sender()?;
        let template = Arc::new(config.template(sender)?);
        info!(
            target: STRESS_TARGET,
            kind = ?kind,
            from = ?sender,
            endpoint = connections.endpoint(),
            workers = spam.worker_count(),
            max_transaction = spam.max_transaction,
            "Preparing run"
        );

        let strategy = match kind {
            TransactionKind::Unsigned => SubmissionStrategy::Unsigned,
            TransactionKind::Async => SubmissionStrategy::Async {
                callback_url: config.async_advertised_url.clone(),
            },
            TransactionKind::Signed | TransactionKind::Private => {
                let wallet = config
                    .wallet()?
                    .context("Signed transactions need a private key")?;
                let wallet = match register_account(&connections, &nonces, wallet, &shutdown).await
                {
                    Ok(wallet) => wallet,
                    Err(e) => {
                        nonces.close().await;
                        return Err(e);
                    }
                };
                if kind == TransactionKind::Private {
                    let from = template.private_from.clone().unwrap_or_default();
                    SubmissionStrategy::Private {
                        wallet,
                        distributor: Arc::new(PayloadDistributor::new(
                            from,
                            &config.transaction_manager_urls,
                        )),
                    }
                } else {
                    SubmissionStrategy::Signed { wallet }
                }
            }
        };

        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
        let tracker = ConfirmationTracker::new(
            spam.tracker.clone(),
            connections.clone(),
            counters.clone(),
            intake_rx,
            shutdown.clone(),
        );
        let ready = tracker.ready_signal();
        let stats_task = tokio::spawn(forward_stats(tracker.subscribe_stats(), latest));

        let gateway_task = if kind == TransactionKind::Async {
            let gateway =
                AsyncGateway::bind(&config.async_addr, intake_tx.clone(), counters.clone()).await?;
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = gateway.run(token).await {
                    error!(error = %e, "Async callback server failed");
                }
            }))
        } else {
            None
        };

        let tracker_task = tokio::spawn(tracker.run());

        let pool = DispatchPool::new(DispatchContext {
            limiter: spam
                .target_tps
                .map(|tps| Arc::new(TokenBucket::per_second(tps))),
            budget: Arc::new(TxBudget::new(spam.max_transaction)),
            config: spam,
            connections,
            nonces: nonces.clone(),
            strategy: Arc::new(strategy),
            template,
            counters: counters.clone(),
            intake: intake_tx,
            ready,
            shutdown: shutdown.clone(),
        });
        let pool_report = pool.run().await;

        if gateway_task.is_some() && !shutdown.is_cancelled() {
            info!(
                target: STRESS_TARGET,
                sent = pool_report.sent,
                "All async transactions submitted, waiting for callbacks until shutdown"
            );
        }

        let tracked = tracker_task.await.context("Tracker task panicked")?;
        if let Some(task) = gateway_task {
            shutdown.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "Async callback server task panicked");
            }
        }
        nonces.close().await;
        if let Err(e) = stats_task.await {
            debug!(error = %e, "Stats forwarder stopped");
        }

        let tracked = tracked?;
        let report = RunReport {
            kind,
            workers: pool_report.workers,
            sent: counters.sent(),
            failed: counters.failed(),
            confirmed: tracked.confirmed,
            pending: tracked.pending,
            stuck: tracked.stuck,
            exhausted_workers: pool_report.exhausted_workers,
            last_stats: tracked.last_stats,
        };
        info!(
            target: STRESS_TARGET,
            sent = report.sent,
            failed = report.failed,
            confirmed = report.confirmed,
            pending = report.pending,
            stuck = report.stuck,
            "Run finished"
        );
        Ok(report)
    }
}

/// Registers the signing account at its pending on-chain nonce and binds
/// the wallet to the node's chain id.
async fn register_account(
    connections: &ConnectionManager,
    nonces: &NonceManager,
    wallet: LocalWallet,
    shutdown: &CancellationToken,
) -> Result<LocalWallet> {
    let rpc = connections.dial(shutdown).await?;
    let address = wallet.address();

    let chain_id = rpc.chain_id().await.context("Failed to fetch chain id")?;
    let nonce = rpc
        .transaction_count(address, true)
        .await
        .context("Failed to fetch account nonce")?;
    let balance = rpc
        .balance(address)
        .await
        .context("Failed to fetch account balance")?;

    nonces.register(address, nonce).await?;
    info!(
        target: STRESS_TARGET,
        address = ?address,
        chain_id,
        nonce,
        balance = %ethers::utils::format_ether(balance),
        "Account registered"
    );
    Ok(wallet.with_chain_id(chain_id))
}

async fn forward_stats(
    mut stats: broadcast::Receiver<StatsSnapshot>,
    latest: watch::Sender<Option<StatsSnapshot>>,
) {
    loop {
        match stats.recv().await {
            Ok(snapshot) => {
                latest.send_replace(Some(snapshot));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Stats forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
