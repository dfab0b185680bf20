//! The draining flag and listener-close signal.
//!
//! The distilled design preserves a fixed-sleep drain sequence rather than an
//! active-connection counter (see SPEC_FULL.md Open Questions): in-flight connection
//! tasks are simply left to finish or be killed by the orchestrator's termination grace
//! period. What this module owns is therefore small: a monotonic "are we draining" flag
//! consulted by the readiness probe and the accept loop, and a one-shot signal that tells
//! the accept loop to stop calling `accept()` and return.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct DrainState {
    draining: Arc<AtomicBool>,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
}

impl DrainState {
    pub fn new() -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        DrainState {
            draining: Arc::new(AtomicBool::new(false)),
            close_tx: Arc::new(close_tx),
            close_rx,
        }
    }

    /// Step 1 of the shutdown sequence: set the flag. Readiness observes this immediately.
    pub fn begin_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Step 3: signal the accept loop to stop accepting and return.
    pub fn close_listener(&self) {
        let _ = self.close_tx.send(true);
    }

    /// Resolves once `close_listener` has been called. Used in the accept loop's `select!`.
    pub async fn wait_for_close(&self) {
        let mut rx = self.close_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Default for DrainState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draining_flag_is_monotonic() {
        let drain = DrainState::new();
        assert!(!drain.is_draining());
        drain.begin_draining();
        assert!(drain.is_draining());
        drain.begin_draining();
        assert!(drain.is_draining());
    }

    #[tokio::test]
    async fn wait_for_close_resolves_after_close_listener() {
        let drain = DrainState::new();
        let waiter = drain.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_close().await;
        });
        tokio::task::yield_now().await;
        drain.close_listener();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_close_returns_immediately_if_already_closed() {
        let drain = DrainState::new();
        drain.close_listener();
        tokio::time::timeout(std::time::Duration::from_millis(100), drain.wait_for_close())
            .await
            .expect("wait_for_close should resolve immediately once already closed");
    }
}
