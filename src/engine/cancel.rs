use tokio::sync::watch;

/// Owning side of a job's cancellation channel. Held in the engine's
/// cancel table until the job reaches a terminal state.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelSignal { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observing side, cloned into the supervisor and every provider call.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the job is cancelled. If the handle is dropped without
    /// firing (normal completion), this never resolves, so it is only safe
    /// inside a `select!` against real work.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// A signal that never fires, for callers outside a job context.
    pub fn detached() -> Self {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        Self { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_observes_cancel() {
        let (handle, signal) = CancelHandle::new();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
        // The future resolves promptly once fired.
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("cancelled() should resolve after cancel()");
    }

    #[tokio::test]
    async fn dropped_handle_does_not_fire() {
        let (handle, signal) = CancelHandle::new();
        drop(handle);
        assert!(!signal.is_cancelled());
        let waited =
            tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(waited.is_err(), "signal must stay pending after drop");
    }

    #[tokio::test]
    async fn detached_signal_never_fires() {
        let signal = CancelSignal::detached();
        assert!(!signal.is_cancelled());
        let waited =
            tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(waited.is_err());
    }
}
