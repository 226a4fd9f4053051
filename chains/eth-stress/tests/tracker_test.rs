mod common;

use common::{eventually, MockChain, MockDialer};
use core_logic::{
    ConfirmationMode, LoadCounters, RetryConfig, StatsSnapshot, TrackerConfig, TrackerError,
};
use eth_stress::connection::ConnectionManager;
use eth_stress::tracker::{ConfirmationTracker, Submission, TrackerReport};
use ethers::types::TxHash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Harness {
    intake: mpsc::Sender<Submission>,
    counters: Arc<LoadCounters>,
    stats: broadcast::Receiver<StatsSnapshot>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<TrackerReport, TrackerError>>,
}

async fn start(chain: Arc<MockChain>, config: TrackerConfig) -> Harness {
    let counters = Arc::new(LoadCounters::default());
    let connections = Arc::new(ConnectionManager::new(
        MockDialer::new(chain, 0),
        RetryConfig::new(1, 1),
        counters.clone(),
    ));
    let (intake, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();

    let tracker =
        ConfirmationTracker::new(config, connections, counters.clone(), rx, shutdown.clone());
    let mut ready = tracker.ready_signal();
    let stats = tracker.subscribe_stats();
    let task = tokio::spawn(tracker.run());

    tokio::time::timeout(Duration::from_secs(5), ready.wait_for(|ready| *ready))
        .await
        .expect("tracker never became ready")
        .unwrap();

    Harness {
        intake,
        counters,
        stats,
        shutdown,
        task,
    }
}

impl Harness {
    async fn submit(&self, hash: TxHash) {
        self.intake.send((hash, Instant::now())).await.unwrap();
    }
}

fn tracker_config(mode: ConfirmationMode) -> TrackerConfig {
    TrackerConfig {
        mode,
        tick_interval_ms: 10,
        stuck_threshold_ms: 60_000,
        recheck_after_ms: 60_000,
    }
}

#[tokio::test]
async fn test_new_head_confirms_pending_transaction() {
    let chain = MockChain::with_heads();
    let harness = start(chain.clone(), tracker_config(ConfirmationMode::Subscription)).await;
    let hash = TxHash::repeat_byte(1);

    harness.submit(hash).await;
    // Let the tracker take the hash before the block shows up
    tokio::time::sleep(Duration::from_millis(20)).await;
    chain.mine(hash).await;

    let counters = harness.counters.clone();
    eventually(|| {
        let counters = counters.clone();
        async move { counters.confirmed() == 1 }
    })
    .await;

    drop(harness.intake);
    let report = harness.task.await.unwrap().unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.pending, 0);
    assert!(harness.shutdown.is_cancelled());
}

#[tokio::test]
async fn test_duplicate_hash_is_confirmed_once() {
    let chain = MockChain::new();
    chain.hold();
    let harness = start(chain.clone(), tracker_config(ConfirmationMode::Polling)).await;
    let hash = TxHash::repeat_byte(2);

    harness.submit(hash).await;
    harness.submit(hash).await;
    chain.mine(hash).await;
    // Arrives after it was settled
    let counters = harness.counters.clone();
    eventually(|| {
        let counters = counters.clone();
        async move { counters.confirmed() == 1 }
    })
    .await;
    harness.submit(hash).await;

    drop(harness.intake);
    let report = harness.task.await.unwrap().unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(harness.counters.confirmed(), 1);
}

#[tokio::test]
async fn test_auto_mode_falls_back_to_polling() {
    let chain = MockChain::new();
    let harness = start(chain.clone(), tracker_config(ConfirmationMode::Auto)).await;
    let hash = TxHash::repeat_byte(3);

    chain.mine(hash).await;
    harness.submit(hash).await;
    drop(harness.intake);

    let report = tokio::time::timeout(Duration::from_secs(5), harness.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.confirmed, 1);
}

#[tokio::test]
async fn test_stuck_transaction_is_reported_and_kept() {
    let chain = MockChain::new();
    chain.hold();
    let config = TrackerConfig {
        stuck_threshold_ms: 30,
        ..tracker_config(ConfirmationMode::Polling)
    };
    let mut harness = start(chain, config).await;
    harness.submit(TxHash::repeat_byte(4)).await;

    let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = harness.stats.recv().await.unwrap();
            if snapshot.stuck == 1 {
                return snapshot;
            }
        }
    })
    .await
    .expect("stuck transaction was not reported");
    assert_eq!(snapshot.pending, 1);
    assert_eq!(snapshot.confirmed_total, 0);

    harness.shutdown.cancel();
    let report = harness.task.await.unwrap().unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(report.stuck, 1);
    assert!(report.last_stats.is_some());
}

#[tokio::test]
async fn test_stuck_clock_starts_at_submission() {
    let chain = MockChain::new();
    chain.hold();
    let config = TrackerConfig {
        stuck_threshold_ms: 5_000,
        ..tracker_config(ConfirmationMode::Polling)
    };
    let mut harness = start(chain, config).await;

    // Queued behind a backlog for longer than the threshold
    let submitted = Instant::now()
        .checked_sub(Duration::from_secs(10))
        .unwrap();
    harness
        .intake
        .send((TxHash::repeat_byte(5), submitted))
        .await
        .unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = harness.stats.recv().await.unwrap();
            if snapshot.pending == 1 {
                return snapshot;
            }
        }
    })
    .await
    .expect("transaction was not tracked");
    assert_eq!(snapshot.stuck, 1);

    harness.shutdown.cancel();
    harness.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_closed_head_subscription_is_fatal() {
    let chain = MockChain::with_heads();
    let harness = start(chain.clone(), tracker_config(ConfirmationMode::Subscription)).await;

    chain.close_heads();

    let err = tokio::time::timeout(Duration::from_secs(5), harness.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, TrackerError::UpstreamLost { .. }));
    assert!(harness.shutdown.is_cancelled());
}

#[tokio::test]
async fn test_subscription_fails_without_head_support() {
    let chain = MockChain::new();
    let counters = Arc::new(LoadCounters::default());
    let connections = Arc::new(ConnectionManager::new(
        MockDialer::new(chain, 0),
        RetryConfig::new(1, 1),
        counters.clone(),
    ));
    let (_intake, rx) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let tracker = ConfirmationTracker::new(
        tracker_config(ConfirmationMode::Subscription),
        connections,
        counters,
        rx,
        shutdown.clone(),
    );
    let ready = tracker.ready_signal();

    let err = tracker.run().await.unwrap_err();
    assert!(matches!(err, TrackerError::UpstreamLost { .. }));
    assert!(!*ready.borrow());
    assert!(shutdown.is_cancelled());
}
