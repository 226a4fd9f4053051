//! Dispatch Worker Pool
//!
//! `min(max_open_connection, max_transaction)` workers share one
//! transaction budget. Each worker holds one connection and loops:
//! rate-limit token, budget reservation, nonce, submission, publication.
//! A failed submission releases its budget unit, reconciles the nonce
//! counter and makes the worker reconnect, up to `retry` times.

mod strategy;

pub use strategy::SubmissionStrategy;

use core_logic::{
    DispatchError, LoadCounters, NetworkError, NonceError, SpamConfig, TokenBucket, TxBudget,
};
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::connection::{ConnectionGuard, ConnectionManager};
use crate::nonce_manager::NonceManager;
use crate::tracker::Submission;
use crate::transaction::TransactionArgs;

/// How a worker's dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    BudgetExhausted,
    SubmissionFailed,
    IntakeClosed,
    Cancelled,
}

/// Per-worker outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub sent: u64,
    pub failed: u64,
}

/// Outcome of the whole pool.
#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    pub workers: u64,
    pub sent: u64,
    pub failed: u64,
    pub exhausted_workers: u64,
}

/// Everything a worker needs, shared between all of them.
pub struct DispatchContext {
    pub config: SpamConfig,
    pub connections: Arc<ConnectionManager>,
    pub nonces: Arc<NonceManager>,
    pub strategy: Arc<SubmissionStrategy>,
    pub template: Arc<TransactionArgs>,
    pub budget: Arc<TxBudget>,
    pub limiter: Option<Arc<TokenBucket>>,
    pub counters: Arc<LoadCounters>,
    pub intake: mpsc::Sender<Submission>,
    pub ready: watch::Receiver<bool>,
    pub shutdown: CancellationToken,
}

pub struct DispatchPool {
    context: Arc<DispatchContext>,
}

impl DispatchPool {
    pub fn new(context: DispatchContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    /// Runs every worker to completion. Dropping the pool's intake sender
    /// when it returns lets the tracker see the end of the stream.
    pub async fn run(self) -> PoolReport {
        let workers = self.context.config.worker_count();
        info!(
            workers,
            strategy = self.context.strategy.name(),
            max_transaction = self.context.config.max_transaction,
            "Starting dispatch workers"
        );

        let mut set = JoinSet::new();
        for i in 0..workers {
            let context = self.context.clone();
            let worker_id = format!("{:03}", i + 1);
            let span = tracing::info_span!("worker", worker_id = %worker_id);
            set.spawn(async move { run_worker(&context).await }.instrument(span));
        }
        drop(self);

        let mut report = PoolReport {
            workers,
            ..Default::default()
        };
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(stats)) => {
                    report.sent += stats.sent;
                    report.failed += stats.failed;
                }
                Ok(Err(DispatchError::Cancelled))
                | Ok(Err(DispatchError::Connection(NetworkError::Cancelled))) => {
                    debug!("Worker cancelled");
                }
                Ok(Err(e)) => {
                    if matches!(
                        e,
                        DispatchError::Connection(NetworkError::ConnectionExhausted { .. })
                    ) {
                        report.exhausted_workers += 1;
                    }
                    error!(error = %e, "Worker stopped");
                }
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }

        info!(
            sent = report.sent,
            failed = report.failed,
            exhausted_workers = report.exhausted_workers,
            "Dispatch workers finished"
        );
        report
    }
}

async fn run_worker(ctx: &DispatchContext) -> Result<WorkerStats, DispatchError> {
    let mut ready = ctx.ready.clone();
    let started = tokio::select! {
        biased;
        _ = ctx.shutdown.cancelled() => false,
        ok = async { ready.wait_for(|ready| *ready).await.is_ok() } => ok,
    };
    if !started {
        return Err(DispatchError::Cancelled);
    }

    let mut stats = WorkerStats::default();
    let cycles = ctx.config.retry.max(1);

    for cycle in 0..cycles {
        if ctx.budget.is_exhausted() {
            break;
        }

        let connection = ctx.connections.acquire(&ctx.shutdown).await?;
        debug!(cycle = cycle + 1, "Connection acquired");

        match dispatch_loop(ctx, &connection, &mut stats).await? {
            LoopExit::BudgetExhausted | LoopExit::IntakeClosed => return Ok(stats),
            LoopExit::Cancelled => return Err(DispatchError::Cancelled),
            LoopExit::SubmissionFailed => {
                drop(connection);
                if cycle + 1 < cycles {
                    debug!(cycle = cycle + 1, "Reconnecting after failed submission");
                }
            }
        }
    }

    if !ctx.budget.is_exhausted() {
        warn!(
            cycles,
            sent = stats.sent,
            "Giving up after repeated submission failures"
        );
    }
    Ok(stats)
}

async fn dispatch_loop(
    ctx: &DispatchContext,
    connection: &ConnectionGuard,
    stats: &mut WorkerStats,
) -> Result<LoopExit, DispatchError> {
    let from = ctx.template.from;

    loop {
        if ctx.budget.is_exhausted() {
            return Ok(LoopExit::BudgetExhausted);
        }

        if let Some(limiter) = &ctx.limiter {
            if !limiter.acquire(&ctx.shutdown).await {
                return Ok(LoopExit::Cancelled);
            }
        }

        if !ctx.budget.try_reserve() {
            return Ok(LoopExit::BudgetExhausted);
        }

        let nonce = if ctx.strategy.needs_nonce() {
            match ctx.nonces.next(from).await {
                Ok(nonce) => Some(nonce),
                Err(e) => {
                    ctx.budget.release();
                    if ctx.shutdown.is_cancelled() {
                        return Ok(LoopExit::Cancelled);
                    }
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let submitted_at = Instant::now();
        let submitted = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => {
                ctx.budget.release();
                return Ok(LoopExit::Cancelled);
            }
            result = ctx.strategy.submit(connection.rpc(), &ctx.template, nonce) => result,
        };

        match submitted {
            Err(e) => {
                ctx.budget.release();
                ctx.counters.record_failed();
                stats.failed += 1;
                warn!(nonce = ?nonce, error = %e, "SendTransaction failed");
                if ctx.strategy.needs_nonce() {
                    reconcile_nonce(ctx, connection, from).await;
                }
                return Ok(LoopExit::SubmissionFailed);
            }
            Ok(hash) => {
                ctx.counters.record_sent();
                stats.sent += 1;
                debug!(tx_hash = ?hash, nonce = ?nonce, "Transaction sent");

                if let Some(hash) = hash.filter(|_| ctx.strategy.publishes()) {
                    tokio::select! {
                        biased;
                        _ = ctx.shutdown.cancelled() => return Ok(LoopExit::Cancelled),
                        sent = ctx.intake.send((hash, submitted_at)) => {
                            if sent.is_err() {
                                return Ok(LoopExit::IntakeClosed);
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn reconcile_nonce(ctx: &DispatchContext, connection: &ConnectionGuard, from: Address) {
    match ctx.nonces.refresh_from_chain(from, connection.rpc()).await {
        Ok(next) => debug!(address = ?from, next, "Nonce reconciled with chain"),
        Err(e) => match e.downcast_ref::<NonceError>() {
            Some(NonceError::Conflict { .. }) => debug!(error = %e, "Nonce refresh rejected"),
            _ => warn!(address = ?from, error = %e, "Nonce reconciliation failed"),
        },
    }
}
