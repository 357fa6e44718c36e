use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Monotonic `Running -> Closing` state plus the signal every blocking
/// operation of the producer races against.
#[derive(Debug, Default)]
pub struct Shutdown {
    closing: AtomicBool,
    signal: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves to `Closing` and fires the signal.
    ///
    /// Returns `true` only for the call that performed the transition. Must
    /// not be called while holding the producer's resource lock.
    pub fn stop(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.signal.cancel();
        true
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Future that completes once `stop` has been called.
    pub async fn closed(&self) {
        self.signal.cancelled().await
    }

    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }
}
