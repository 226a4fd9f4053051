use core_logic::{with_retry, LoadCounters, NetworkError, RetryConfig, RetryError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::rpc::{Dialer, StressRpc};

/// Dials the RPC endpoint with bounded retries and exponential backoff.
pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    retry: RetryConfig,
    counters: Arc<LoadCounters>,
}

impl ConnectionManager {
    pub fn new(dialer: Arc<dyn Dialer>, retry: RetryConfig, counters: Arc<LoadCounters>) -> Self {
        Self {
            dialer,
            retry,
            counters,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.dialer.endpoint()
    }

    /// Dials without counting the connection as open.
    pub async fn dial(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Arc<dyn StressRpc>, NetworkError> {
        let endpoint = self.dialer.endpoint();
        with_retry(self.retry, "dial", shutdown, |attempt| {
            let dialer = self.dialer.clone();
            async move {
                debug!(
                    endpoint = dialer.endpoint(),
                    attempt = attempt + 1,
                    "Dialing RPC endpoint"
                );
                dialer.dial().await
            }
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled { .. } => NetworkError::Cancelled,
            RetryError::Exhausted { attempts, last, .. } => NetworkError::ConnectionExhausted {
                endpoint: endpoint.to_string(),
                attempts,
                reason: last,
            },
        })
    }

    /// Dials and returns a guard that keeps the open-connection count.
    pub async fn acquire(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<ConnectionGuard, NetworkError> {
        let rpc = self.dial(shutdown).await?;
        Ok(ConnectionGuard::new(rpc, self.counters.clone()))
    }
}

/// An open worker connection. Dropping it closes the connection and
/// decrements the open-connection counter exactly once.
pub struct ConnectionGuard {
    rpc: Arc<dyn StressRpc>,
    counters: Arc<LoadCounters>,
}

impl ConnectionGuard {
    fn new(rpc: Arc<dyn StressRpc>, counters: Arc<LoadCounters>) -> Self {
        counters.connection_opened();
        Self { rpc, counters }
    }

    pub fn rpc(&self) -> &dyn StressRpc {
        self.rpc.as_ref()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counters.connection_closed();
    }
}
