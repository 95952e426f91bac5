//! Process-wide cancellation.
//!
//! A [`ShutdownTrigger`] flips a `watch` flag once; every [`ShutdownSignal`] clone
//! observes it. Long-running loops race their suspension point against
//! [`ShutdownSignal::cancelled`] in a `tokio::select!`.

use std::sync::Arc;
use tokio::sync::watch;

/// Owner side: fires the shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Observer side, cheap to clone into every task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a linked trigger and signal.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    /// Request shutdown. Calling it again has no further effect.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal tied to this trigger.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Whether shutdown was requested.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ShutdownSignal {
    /// Whether shutdown was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested or the trigger is dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Err means every trigger is gone, which is treated as shutdown too
        let _ = rx.wait_for(|stop| *stop).await;
    }
}
