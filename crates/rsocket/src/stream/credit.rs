//! Request-n credit for the sending side of a stream.

use crate::protocol::MAX_REQUEST_N;

use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Notify;

/// Outstanding request-n credit granted by the peer.
///
/// One credit allows one PAYLOAD with the NEXT flag. Once the cumulative
/// grant reaches [`MAX_REQUEST_N`] the credit is unbounded and never drops.
#[derive(Debug)]
pub struct Credit {
    available: AtomicU32,
    notify: Notify,
}

impl Credit {
    /// Create a credit counter starting at `initial`.
    #[must_use]
    pub fn new(initial: u32) -> Self {
        Self {
            available: AtomicU32::new(initial.min(MAX_REQUEST_N)),
            notify: Notify::new(),
        }
    }

    /// Adds `n` credits, saturating at unbounded.
    pub fn grant(&self, n: u32) {
        if n == 0 {
            return;
        }
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(n).min(MAX_REQUEST_N);
            match self.available.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.notify.notify_one();
    }

    /// Takes one credit if available.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if current == MAX_REQUEST_N {
                return true;
            }
            if current == 0 {
                return false;
            }
            match self.available.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Waits until one credit is available and takes it.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Credits currently available.
    #[must_use]
    pub fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire)
    }

    /// Whether the peer granted unbounded demand.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.available() == MAX_REQUEST_N
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_acquire_consumes_credit() {
        let credit = Credit::new(2);
        assert!(credit.try_acquire());
        assert!(credit.try_acquire());
        assert!(!credit.try_acquire());
        assert_eq!(credit.available(), 0);
    }

    #[test]
    fn test_unbounded_never_drains() {
        let credit = Credit::new(MAX_REQUEST_N);
        for _ in 0..1000 {
            assert!(credit.try_acquire());
        }
        assert!(credit.is_unbounded());
    }

    #[test]
    fn test_grant_saturates_to_unbounded() {
        let credit = Credit::new(10);
        credit.grant(MAX_REQUEST_N - 5);
        assert!(credit.is_unbounded());
        credit.grant(u32::MAX);
        assert!(credit.is_unbounded());
    }

    #[test]
    fn test_acquire_waits_for_grant() {
        let credit = Credit::new(0);
        let mut acquire = task::spawn(credit.acquire());
        assert_pending!(acquire.poll());

        credit.grant(1);
        assert!(acquire.is_woken());
        assert_ready!(acquire.poll());
        assert_eq!(credit.available(), 0);
    }

    #[test]
    fn test_grant_before_wait_is_not_lost() {
        let credit = Credit::new(0);
        credit.grant(1);
        let mut acquire = task::spawn(credit.acquire());
        assert_ready!(acquire.poll());
    }
}
