use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// An attempt-indexed backoff schedule. Attempts count from 1.
pub(crate) type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Default schedule for reopening the transport after it drops.
pub(crate) fn default_reconnect_after(tries: u32) -> Duration {
    const STEPS_MS: [u64; 9] = [10, 50, 100, 150, 200, 250, 500, 1000, 2000];
    Duration::from_millis(
        STEPS_MS
            .get((tries as usize).saturating_sub(1))
            .copied()
            .unwrap_or(5000),
    )
}

/// Default schedule for rejoining an errored channel.
pub(crate) fn default_rejoin_after(tries: u32) -> Duration {
    const STEPS_MS: [u64; 3] = [1000, 2000, 5000];
    Duration::from_millis(
        STEPS_MS
            .get((tries as usize).saturating_sub(1))
            .copied()
            .unwrap_or(10_000),
    )
}

/// A cancellable one-shot timer whose delay grows with the attempt count.
///
/// `schedule_timeout` arms (or re-arms) the timer for `backoff(tries)`;
/// `reset` cancels any pending firing and starts the attempt count over.
pub(crate) struct RetryTimer {
    callback: Arc<dyn Fn() + Send + Sync>,
    backoff: Backoff,
    state: Mutex<RetryState>,
}

struct RetryState {
    tries: u32,
    pending: Option<JoinHandle<()>>,
}

impl RetryTimer {
    pub(crate) fn new(callback: Arc<dyn Fn() + Send + Sync>, backoff: Backoff) -> Self {
        Self {
            callback,
            backoff,
            state: Mutex::new(RetryState {
                tries: 0,
                pending: None,
            }),
        }
    }

    pub(crate) fn schedule_timeout(&self) {
        let mut state = self.state.lock().expect("retry timer state poisoned");
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        state.tries += 1;
        let delay = (self.backoff)(state.tries);
        let callback = Arc::clone(&self.callback);
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        }));
    }

    pub(crate) fn reset(&self) {
        let mut state = self.state.lock().expect("retry timer state poisoned");
        state.tries = 0;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
        }
    }
}
