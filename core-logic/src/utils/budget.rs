use std::sync::atomic::{AtomicU64, Ordering};

/// Global transaction budget shared by every dispatch worker.
///
/// A unit is reserved before a submission and released again if the
/// submission fails, so `reserved()` never exceeds the maximum.
#[derive(Debug)]
pub struct TxBudget {
    max: u64,
    reserved: AtomicU64,
}

impl TxBudget {
    pub fn new(max: u64) -> Self {
        Self {
            max,
            reserved: AtomicU64::new(0),
        }
    }

    /// Reserve one unit. Returns `false` once the budget is exhausted.
    pub fn try_reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max).then_some(current + 1)
            })
            .is_ok()
    }

    /// Give back a unit whose submission failed or was cancelled.
    pub fn release(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }

    pub fn is_exhausted(&self) -> bool {
        self.reserved.load(Ordering::Acquire) >= self.max
    }

    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_until_exhausted() {
        let budget = TxBudget::new(2);
        assert!(budget.try_reserve());
        assert!(budget.try_reserve());
        assert!(!budget.try_reserve());
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_release_frees_a_unit() {
        let budget = TxBudget::new(1);
        assert!(budget.try_reserve());
        budget.release();
        assert_eq!(budget.reserved(), 0);
        assert!(budget.try_reserve());
    }

    #[test]
    fn test_release_never_underflows() {
        let budget = TxBudget::new(1);
        budget.release();
        assert_eq!(budget.reserved(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_respect_max() {
        let budget = Arc::new(TxBudget::new(100));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let budget = budget.clone();
            handles.push(tokio::spawn(async move {
                let mut won = 0u64;
                for _ in 0..50 {
                    if budget.try_reserve() {
                        won += 1;
                    }
                    tokio::task::yield_now().await;
                }
                won
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }

        assert_eq!(total, 100);
        assert_eq!(budget.reserved(), 100);
    }
}
