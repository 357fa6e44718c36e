use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Default)]
struct State {
    inflight: u64,
    flush_done: Option<oneshot::Sender<()>>,
}

/// Counts messages accepted by the async producer but not yet acknowledged.
///
/// Holds a single flush waiter. Callers must not run `await_zero` on two
/// tasks at once, nor interleave it with sends from another owner: a second
/// waiter displaces the first, which then fails with
/// [`Error::FlushUnfinished`].
#[derive(Default)]
pub struct InflightTracker {
    state: Mutex<State>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        let mut state = self.lock();
        state.inflight += 1;
        debug!(inflight = state.inflight, "emitting inflight messages to kafka");
    }

    pub fn decrement(&self) {
        let mut state = self.lock();
        if state.inflight == 0 {
            warn!("acknowledgment received with no inflight messages");
            return;
        }
        state.inflight -= 1;
        if state.inflight == 0 {
            if let Some(done) = state.flush_done.take() {
                // The waiter may have given up already.
                let _ = done.send(());
            }
        }
    }

    pub fn inflight(&self) -> u64 {
        self.lock().inflight
    }

    /// Waits until every accepted message has been acknowledged.
    ///
    /// Returns at once when nothing is in flight. `shutdown` firing first
    /// yields [`Error::FlushUnfinished`], `cancel` yields [`Error::Cancelled`].
    pub async fn await_zero(
        &self,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let inflight = {
            let mut state = self.lock();
            if state.inflight == 0 {
                return Ok(());
            }
            state.flush_done = Some(done_tx);
            state.inflight
        };

        debug!(inflight, "flush waiting for inflight messages");
        tokio::select! {
            _ = shutdown.cancelled() => Err(Error::FlushUnfinished),
            _ = cancel.cancelled() => Err(Error::Cancelled),
            done = done_rx => done.map_err(|_| Error::FlushUnfinished),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
