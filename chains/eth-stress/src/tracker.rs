//! Confirmation Tracker
//!
//! Owns the in-flight transaction records. Workers and the async gateway
//! only write [`Submission`]s into the intake channel; nothing else reads or
//! mutates the records, so no lock guards them. Each submission carries the
//! instant the hash was produced, so a backed-up intake does not shorten the
//! measured latency or the stuck clock.
//!
//! Inclusion is detected either from new heads (the block body is matched
//! against the pending set) or by polling each pending hash. In subscription
//! mode, records older than `recheck_after` are polled as well, which picks
//! up transactions mined before their hash reached the tracker.
//!
//! Once per tick the tracker publishes a [`StatsSnapshot`]: it is logged on
//! the `stress` target and sent on a broadcast channel.

use core_logic::{
    is_transient_error, per_second, ConfirmationMode, LatencyStats, LoadCounters, NetworkError,
    StatsSnapshot, ThroughputWindow, TrackerConfig, TrackerError, STRESS_TARGET,
};
use ethers::types::TxHash;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::rpc::{StressRpc, TxStatus};

const POLL_CONCURRENCY: usize = 32;
const STATS_CAPACITY: usize = 16;
/// Widest gap between two heads that is back-filled block by block.
const MAX_HEAD_GAP: u64 = 32;
/// Consecutive failed block-number fetches before the upstream counts as lost.
const MAX_TICK_FAILURES: u32 = 10;
/// Confirmed hashes remembered for duplicate suppression.
const SETTLED_CAPACITY: usize = 65_536;

/// A hash handed to the tracker, with the instant it was submitted.
pub type Submission = (TxHash, Instant);

#[derive(Debug, Clone, Copy)]
struct InFlight {
    sent_at: Instant,
    stuck_reported: bool,
}

/// The most recently confirmed hashes, oldest evicted first. A duplicate
/// delivered after its hash was evicted is tracked again.
#[derive(Debug)]
struct SettledRing {
    order: VecDeque<TxHash>,
    members: HashSet<TxHash>,
    capacity: usize,
}

impl SettledRing {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, hash: &TxHash) -> bool {
        self.members.contains(hash)
    }

    fn insert(&mut self, hash: TxHash) {
        if !self.members.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// In-flight and settled transactions.
#[derive(Debug)]
struct Ledger {
    in_flight: HashMap<TxHash, InFlight>,
    settled: SettledRing,
    latency: LatencyStats,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::with_settled_capacity(SETTLED_CAPACITY)
    }
}

impl Ledger {
    fn with_settled_capacity(capacity: usize) -> Self {
        Self {
            in_flight: HashMap::new(),
            settled: SettledRing::new(capacity),
            latency: LatencyStats::default(),
        }
    }

    /// Starts tracking `hash`, submitted at `sent_at`. Returns `false` for a
    /// hash already known.
    fn track(&mut self, hash: TxHash, sent_at: Instant) -> bool {
        if self.settled.contains(&hash) || self.in_flight.contains_key(&hash) {
            return false;
        }
        self.in_flight.insert(
            hash,
            InFlight {
                sent_at,
                stuck_reported: false,
            },
        );
        true
    }

    /// Settles `hash` and returns its confirmation latency, or `None` if it
    /// was not pending.
    fn confirm(&mut self, hash: TxHash, now: Instant) -> Option<Duration> {
        let record = self.in_flight.remove(&hash)?;
        self.settled.insert(hash);
        let latency = now.saturating_duration_since(record.sent_at);
        self.latency.record(latency);
        Some(latency)
    }

    fn is_pending(&self, hash: &TxHash) -> bool {
        self.in_flight.contains_key(hash)
    }

    /// Records that crossed `threshold` since the last scan.
    fn newly_stuck(&mut self, now: Instant, threshold: Duration) -> Vec<(TxHash, Duration)> {
        self.in_flight
            .iter_mut()
            .filter_map(|(hash, record)| {
                let age = now.saturating_duration_since(record.sent_at);
                if record.stuck_reported || age < threshold {
                    return None;
                }
                record.stuck_reported = true;
                Some((*hash, age))
            })
            .collect()
    }

    fn poll_candidates(&self, now: Instant, min_age: Duration) -> Vec<TxHash> {
        self.in_flight
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.sent_at) >= min_age)
            .map(|(hash, _)| *hash)
            .collect()
    }

    fn pending(&self) -> u64 {
        self.in_flight.len() as u64
    }

    fn stuck(&self) -> u64 {
        self.in_flight.values().filter(|r| r.stuck_reported).count() as u64
    }
}

/// Summary returned when the tracker stops.
#[derive(Debug, Clone, Default)]
pub struct TrackerReport {
    pub confirmed: u64,
    pub pending: u64,
    pub stuck: u64,
    pub last_stats: Option<StatsSnapshot>,
}

pub struct ConfirmationTracker {
    config: TrackerConfig,
    connections: Arc<ConnectionManager>,
    counters: Arc<LoadCounters>,
    intake: mpsc::Receiver<Submission>,
    ready: watch::Sender<bool>,
    stats: broadcast::Sender<StatsSnapshot>,
    shutdown: CancellationToken,
}

impl ConfirmationTracker {
    pub fn new(
        config: TrackerConfig,
        connections: Arc<ConnectionManager>,
        counters: Arc<LoadCounters>,
        intake: mpsc::Receiver<Submission>,
        shutdown: CancellationToken,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        let (stats, _) = broadcast::channel(STATS_CAPACITY);
        Self {
            config,
            connections,
            counters,
            intake,
            ready,
            stats,
            shutdown,
        }
    }

    /// Flips to `true` once the tracker is connected (and subscribed).
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn subscribe_stats(&self) -> broadcast::Receiver<StatsSnapshot> {
        self.stats.subscribe()
    }

    /// Runs until shutdown, or until the intake is closed and every
    /// transaction is confirmed. An upstream failure cancels `shutdown`.
    pub async fn run(self) -> Result<TrackerReport, TrackerError> {
        let Self {
            config,
            connections,
            counters,
            mut intake,
            ready,
            stats,
            shutdown,
        } = self;
        let endpoint = connections.endpoint().to_string();

        let rpc = match connections.dial(&shutdown).await {
            Ok(rpc) => rpc,
            Err(NetworkError::Cancelled) => return Ok(TrackerReport::default()),
            Err(e) => {
                error!(error = %e, "Tracker could not connect");
                shutdown.cancel();
                return Err(e.into());
            }
        };

        let mut heads = match config.mode {
            ConfirmationMode::Polling => None,
            ConfirmationMode::Subscription => match rpc.subscribe_heads().await {
                Ok(heads) => Some(heads),
                Err(e) => {
                    shutdown.cancel();
                    return Err(TrackerError::UpstreamLost {
                        endpoint,
                        reason: format!("{:#}", e),
                    });
                }
            },
            ConfirmationMode::Auto => match rpc.subscribe_heads().await {
                Ok(heads) => Some(heads),
                Err(e) => {
                    info!(
                        reason = %format!("{:#}", e),
                        "Head subscription unavailable, polling instead"
                    );
                    None
                }
            },
        };

        let mut reconciler = Reconciler::new(config, counters, stats, heads.is_some());
        ready.send_replace(true);
        info!(
            target: STRESS_TARGET,
            endpoint = %endpoint,
            subscribed = heads.is_some(),
            "Tracker ready"
        );

        let tick = reconciler.config.tick_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut intake_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Tracker observed shutdown");
                    break;
                }
                submission = intake.recv(), if intake_open => match submission {
                    Some((hash, sent_at)) => reconciler.track(hash, sent_at),
                    None => {
                        debug!("Tracker intake closed");
                        intake_open = false;
                    }
                },
                head = next_head(&mut heads) => match head {
                    Some(number) => reconciler.on_head(rpc.as_ref(), number).await,
                    None => {
                        error!(endpoint = %endpoint, "Head subscription closed");
                        shutdown.cancel();
                        return Err(TrackerError::UpstreamLost {
                            endpoint,
                            reason: "head subscription closed".to_string(),
                        });
                    }
                },
                _ = ticker.tick() => {
                    if let Err(reason) = reconciler.on_tick(rpc.as_ref()).await {
                        error!(endpoint = %endpoint, reason = %reason, "Lost upstream connection");
                        shutdown.cancel();
                        return Err(TrackerError::UpstreamLost { endpoint, reason });
                    }
                }
            }

            if !intake_open && reconciler.ledger.pending() == 0 {
                info!(
                    target: STRESS_TARGET,
                    confirmed = reconciler.counters.confirmed(),
                    "All transactions confirmed"
                );
                shutdown.cancel();
                break;
            }
        }

        Ok(reconciler.report())
    }
}

async fn next_head(heads: &mut Option<mpsc::Receiver<u64>>) -> Option<u64> {
    match heads {
        Some(heads) => heads.recv().await,
        None => std::future::pending().await,
    }
}

/// Per-run state of the tracker loop.
struct Reconciler {
    config: TrackerConfig,
    counters: Arc<LoadCounters>,
    stats: broadcast::Sender<StatsSnapshot>,
    subscribed: bool,
    ledger: Ledger,
    window: ThroughputWindow,
    last_tick: Instant,
    last_sent: u64,
    last_confirmed: u64,
    last_head: Option<u64>,
    tick_failures: u32,
    last_stats: Option<StatsSnapshot>,
}

impl Reconciler {
    fn new(
        config: TrackerConfig,
        counters: Arc<LoadCounters>,
        stats: broadcast::Sender<StatsSnapshot>,
        subscribed: bool,
    ) -> Self {
        let last_sent = counters.sent();
        let last_confirmed = counters.confirmed();
        Self {
            config,
            counters,
            stats,
            subscribed,
            ledger: Ledger::default(),
            window: ThroughputWindow::new(),
            last_tick: Instant::now(),
            last_sent,
            last_confirmed,
            last_head: None,
            tick_failures: 0,
            last_stats: None,
        }
    }

    fn track(&mut self, hash: TxHash, sent_at: Instant) {
        if self.ledger.track(hash, sent_at) {
            debug!(tx_hash = ?hash, "Tracking transaction");
        } else {
            debug!(tx_hash = ?hash, "Ignoring duplicate transaction hash");
        }
    }

    fn confirm(&mut self, hash: TxHash, gas: u64) {
        if let Some(latency) = self.ledger.confirm(hash, Instant::now()) {
            self.counters.record_confirmed();
            info!(
                target: STRESS_TARGET,
                tx_hash = ?hash,
                latency_ms = latency.as_millis() as u64,
                gas,
                "Transaction confirmed"
            );
        }
    }

    async fn on_head(&mut self, rpc: &dyn StressRpc, number: u64) {
        let from = match self.last_head {
            Some(last) if number > last => {
                (last + 1).max(number.saturating_sub(MAX_HEAD_GAP - 1))
            }
            _ => number,
        };
        self.last_head = Some(self.last_head.map_or(number, |last| last.max(number)));

        if self.ledger.pending() == 0 {
            return;
        }

        for block in from..=number {
            match rpc.block_transactions(block).await {
                Ok(included) => {
                    for tx in included {
                        if self.ledger.is_pending(&tx.hash) {
                            self.confirm(tx.hash, tx.gas);
                        }
                    }
                }
                Err(e) => warn!(block, error = %e, "Failed to fetch block"),
            }
        }
    }

    async fn poll_pending(&mut self, rpc: &dyn StressRpc) {
        let min_age = if self.subscribed {
            self.config.recheck_after()
        } else {
            Duration::ZERO
        };
        let candidates = self.ledger.poll_candidates(Instant::now(), min_age);
        if candidates.is_empty() {
            return;
        }

        let statuses: Vec<_> = stream::iter(candidates)
            .map(|hash| async move { (hash, rpc.transaction_status(hash).await) })
            .buffer_unordered(POLL_CONCURRENCY)
            .collect()
            .await;

        for (hash, status) in statuses {
            match status {
                Ok(TxStatus::Included { gas, .. }) => self.confirm(hash, gas),
                Ok(TxStatus::Pending) | Ok(TxStatus::NotFound) => {}
                Err(e) if is_transient_error(&e) => {
                    debug!(tx_hash = ?hash, error = %e, "Transaction lookup failed")
                }
                Err(e) => warn!(tx_hash = ?hash, error = %e, "Transaction lookup failed"),
            }
        }
    }

    /// One stats tick. Errors only when the upstream looks lost.
    async fn on_tick(&mut self, rpc: &dyn StressRpc) -> Result<(), String> {
        self.poll_pending(rpc).await;

        let block_number = match rpc.block_number().await {
            Ok(number) => {
                self.tick_failures = 0;
                number
            }
            Err(e) => {
                self.tick_failures += 1;
                error!(error = %e, failures = self.tick_failures, "Failed to get block number");
                if self.tick_failures >= MAX_TICK_FAILURES {
                    return Err(format!("{:#}", e));
                }
                return Ok(());
            }
        };

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_tick);
        let sent_total = self.counters.sent();
        let confirmed_total = self.counters.confirmed();

        let sent_per_sec = per_second(sent_total.saturating_sub(self.last_sent), elapsed);
        let confirmed_per_sec =
            per_second(confirmed_total.saturating_sub(self.last_confirmed), elapsed);
        let confirmed_per_sec_avg = self.window.push(confirmed_per_sec);

        self.last_tick = now;
        self.last_sent = sent_total;
        self.last_confirmed = confirmed_total;

        for (hash, age) in self.ledger.newly_stuck(now, self.config.stuck_threshold()) {
            warn!(
                tx_hash = ?hash,
                pending_secs = age.as_secs(),
                "Transaction pending for too long"
            );
        }

        let snapshot = StatsSnapshot {
            sent_total,
            failed_total: self.counters.failed(),
            confirmed_total,
            pending: self.ledger.pending(),
            stuck: self.ledger.stuck(),
            sent_per_sec,
            confirmed_per_sec,
            confirmed_per_sec_avg,
            block_number,
            open_connections: self.counters.open_connections(),
            latency: self.ledger.latency.snapshot(),
            ..Default::default()
        }
        .stamped();

        info!(
            target: STRESS_TARGET,
            seen_tx_per_sec_avg = format!("{:.2}", snapshot.confirmed_per_sec_avg),
            seen_tx_per_sec = format!("{:.2}", snapshot.confirmed_per_sec),
            sent_tx_per_sec = format!("{:.2}", snapshot.sent_per_sec),
            block_number = snapshot.block_number,
            connections = snapshot.open_connections,
            seen_tx = snapshot.confirmed_total,
            sent_tx = snapshot.sent_total,
            pending_tx = snapshot.pending,
            "Stats update"
        );

        let _ = self.stats.send(snapshot.clone());
        self.last_stats = Some(snapshot);
        Ok(())
    }

    fn report(&self) -> TrackerReport {
        TrackerReport {
            confirmed: self.counters.confirmed(),
            pending: self.ledger.pending(),
            stuck: self.ledger.stuck(),
            last_stats: self.last_stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> TxHash {
        TxHash::repeat_byte(byte)
    }

    #[test]
    fn test_duplicate_track_is_ignored() {
        let mut ledger = Ledger::default();
        let now = Instant::now();
        assert!(ledger.track(hash(1), now));
        assert!(!ledger.track(hash(1), now));
        assert_eq!(ledger.pending(), 1);
    }

    #[test]
    fn test_confirm_is_idempotent() {
        let mut ledger = Ledger::default();
        let now = Instant::now();
        ledger.track(hash(1), now);

        assert!(ledger.confirm(hash(1), now).is_some());
        assert!(ledger.confirm(hash(1), now).is_none());
        // A settled hash delivered again is not tracked anew
        assert!(!ledger.track(hash(1), now));
        assert_eq!(ledger.pending(), 0);
        assert_eq!(ledger.latency.snapshot().samples, 1);
    }

    #[test]
    fn test_latency_counts_from_submission() {
        let mut ledger = Ledger::default();
        let submitted = Instant::now();
        // Picked off the intake long after submission
        ledger.track(hash(1), submitted);

        let latency = ledger.confirm(hash(1), submitted + Duration::from_secs(5));
        assert_eq!(latency, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_settled_hashes_are_bounded() {
        let mut ledger = Ledger::with_settled_capacity(2);
        let now = Instant::now();
        for byte in 1..=3 {
            ledger.track(hash(byte), now);
            ledger.confirm(hash(byte), now);
        }

        assert_eq!(ledger.settled.len(), 2);
        assert!(!ledger.track(hash(3), now));
        assert!(!ledger.track(hash(2), now));
        // Evicted, so it is tracked again
        assert!(ledger.track(hash(1), now));
    }

    #[test]
    fn test_unknown_hash_is_not_confirmed() {
        let mut ledger = Ledger::default();
        assert!(ledger.confirm(hash(7), Instant::now()).is_none());
    }

    #[test]
    fn test_stuck_reported_once_and_kept() {
        let mut ledger = Ledger::default();
        let start = Instant::now();
        ledger.track(hash(1), start);
        ledger.track(hash(2), start + Duration::from_secs(200));

        let later = start + Duration::from_secs(301);
        let stuck = ledger.newly_stuck(later, Duration::from_secs(300));
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].0, hash(1));

        assert!(ledger.newly_stuck(later, Duration::from_secs(300)).is_empty());
        assert_eq!(ledger.pending(), 2);
        assert_eq!(ledger.stuck(), 1);

        // Still confirmable after being flagged
        assert!(ledger.confirm(hash(1), later).is_some());
        assert_eq!(ledger.stuck(), 0);
    }

    #[test]
    fn test_poll_candidates_respect_age() {
        let mut ledger = Ledger::default();
        let start = Instant::now();
        ledger.track(hash(1), start);
        ledger.track(hash(2), start + Duration::from_secs(9));

        let now = start + Duration::from_secs(10);
        assert_eq!(
            ledger.poll_candidates(now, Duration::from_secs(10)),
            vec![hash(1)]
        );
        assert_eq!(ledger.poll_candidates(now, Duration::ZERO).len(), 2);
    }
}
