//! Node-wide cancellation signal

use tokio::sync::watch;

/// Owner side of the shutdown signal
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Observer side of the shutdown signal, cheap to clone into tasks
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Create a new untriggered signal
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Shutdown { tx }
    }

    /// Get an observer for this signal
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Trigger shutdown; repeated calls are no-ops
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Check whether shutdown was triggered
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        // closed while still false: `cancelled` parks forever
        let (tx, rx) = watch::channel(false);
        drop(tx);
        ShutdownSignal { rx }
    }

    /// Check whether shutdown was triggered
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is triggered
    ///
    /// If the owning [`Shutdown`] is dropped without triggering, this never
    /// resolves.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
