use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total attempts, the first one included. Zero behaves like one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 120_000,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: base_delay_ms.saturating_mul(60),
        }
    }

    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay slept before `attempt` (0-based): `base << attempt`, capped.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .base_delay_ms
            .checked_shl(attempt)
            .filter(|d| *d >> attempt == self.base_delay_ms)
            .unwrap_or(u64::MAX)
            .min(self.max_delay_ms);

        Duration::from_millis(delay_ms)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    #[error("{operation} failed after {attempts} attempts. Last error: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: String,
    },
}

/// Runs `operation` up to `config.attempts()` times, sleeping
/// `calculate_delay(attempt)` before each attempt. The backoff sleep
/// yields to `shutdown`.
pub async fn with_retry<T, F, Fut>(
    config: RetryConfig,
    operation_name: &str,
    shutdown: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = config.attempts();
    let mut last_error = String::new();

    for attempt in 0..attempts {
        let delay = config.calculate_delay(attempt);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                return Err(RetryError::Cancelled {
                    operation: operation_name.to_string(),
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt + 1);
                }
                return Ok(result);
            }
            Err(e) => {
                debug!(
                    "{} failed (attempt {}/{}): {:#}",
                    operation_name,
                    attempt + 1,
                    attempts,
                    e
                );
                last_error = format!("{:#}", e);
            }
        }
    }

    Err(RetryError::Exhausted {
        operation: operation_name.to_string(),
        attempts,
        last: last_error,
    })
}

/// Errors a node returns routinely under load; callers log them quietly.
pub fn is_transient_error(error: &anyhow::Error) -> bool {
    let error_msg = format!("{:?}", error).to_lowercase();

    let transient_patterns = [
        "not found",
        "timeout",
        "connection refused",
        "connection reset",
        "network error",
        "temporary failure",
        "service unavailable",
        "rate limited",
        "too many requests",
        "nonce too low",
        "already known",
        "replacement transaction underpriced",
    ];

    transient_patterns
        .iter()
        .any(|pattern| error_msg.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_base_shifted_by_attempt() {
        let config = RetryConfig::new(5, 2000);
        assert_eq!(config.calculate_delay(0), Duration::from_millis(2000));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(4000));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(8000));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::new(70, 2000).with_max_delay(10_000);
        assert_eq!(config.calculate_delay(3), Duration::from_millis(10_000));
        assert_eq!(config.calculate_delay(64), Duration::from_millis(10_000));
    }

    #[test]
    fn test_default_delay_is_exact() {
        let config = RetryConfig::default();
        for _ in 0..20 {
            assert_eq!(config.calculate_delay(0), Duration::from_millis(2000));
            assert_eq!(config.calculate_delay(4), Duration::from_millis(32_000));
        }
    }

    #[test]
    fn test_zero_attempts_behaves_like_one() {
        assert_eq!(RetryConfig::new(0, 1).attempts(), 1);
    }
}
