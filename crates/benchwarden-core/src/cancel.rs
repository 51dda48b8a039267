//! External cancellation of a recovery run.
//!
//! The orchestrator polls [`CancelSignal::is_cancelled`] at checkpoints (after
//! a channel call returns, before a settle period) and races settle periods
//! against [`CancelSignal::cancelled`]. It never aborts a console write.

use tokio::sync::watch;

/// Trigger side. Dropping it without calling [`CancelHandle::cancel`] leaves
/// the run uncancelled.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observer side, cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested; pend forever if it cannot be.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without cancelling.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}
