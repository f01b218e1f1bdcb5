//! Cancellable timed wait with a latched cancel signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time;

/// A timed wait that an external task can interrupt.
///
/// The cancel signal is latched: cancelling while no wait is in flight
/// arms the next [`Waiter::wait`] to return immediately, so a shutdown
/// signal delivered between waits is never lost.
#[derive(Debug, Default)]
pub struct Waiter {
    notify: Notify,
    waiting: AtomicBool,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend the current task for up to `duration`.
    ///
    /// Returns `true` when the full duration elapsed and `false` when
    /// the wait was cancelled.
    pub async fn wait(&self, duration: Duration) -> bool {
        self.waiting.store(true, Ordering::SeqCst);
        let completed = tokio::select! {
            _ = time::sleep(duration) => true,
            _ = self.notify.notified() => false,
        };
        self.waiting.store(false, Ordering::SeqCst);
        completed
    }

    /// Interrupt the wait in flight, or arm the next one to return
    /// immediately. Returns `true` when a wait was actually
    /// interrupted.
    pub fn cancel(&self) -> bool {
        let interrupted = self.waiting.load(Ordering::SeqCst);
        self.notify.notify_one();
        interrupted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn test_wait_expires_naturally() {
        let waiter = Waiter::new();

        let started = Instant::now();
        assert!(waiter.wait(Duration::from_millis(50)).await);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cancel_is_latched() {
        let waiter = Waiter::new();

        // No wait in flight, so nothing was interrupted.
        assert!(!waiter.cancel());

        // The next wait observes the latched signal right away.
        let started = Instant::now();
        assert!(!waiter.wait(Duration::from_secs(10)).await);
        assert!(started.elapsed() < Duration::from_millis(100));

        // The latch is consumed; a fresh wait runs to completion.
        assert!(waiter.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait_in_flight() {
        let waiter = Arc::new(Waiter::new());

        let canceller = waiter.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            assert!(canceller.cancel());
        });

        let started = Instant::now();
        assert!(!waiter.wait(Duration::from_secs(10)).await);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
