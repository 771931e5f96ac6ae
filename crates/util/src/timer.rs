//! Cancellable repeating timer.
//!
//! A [`ContextTimer`] runs its callback as a tokio task. Before each call the
//! interval function is asked how long to wait, given the number of calls so
//! far; returning less than one nanosecond is an invalid interval and stops
//! the timer. The callback keeps the timer running by returning `Ok(true)`;
//! `Ok(false)` or any error stops it.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::TimerId;

/// Callback of a timer; receives the call count (starting at 0).
pub type TimerCallback =
    Arc<dyn Fn(u64) -> BoxFuture<'static, Result<bool, TimerError>> + Send + Sync>;

/// Wait before the call with the given count.
pub type IntervalFunc = Arc<dyn Fn(u64) -> Duration + Send + Sync>;

/// Timer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// Returned by a callback to stop the timer.
    #[error("stop timer")]
    Stop,

    /// The interval function returned less than one nanosecond.
    #[error("invalid interval, {0:?}")]
    InvalidInterval(Duration),

    /// The timer id is not registered.
    #[error("unknown timer, {0}")]
    UnknownTimer(TimerId),

    /// Callback failure; stops the timer.
    #[error("timer callback: {0}")]
    Callback(String),
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A repeating timer that can be started and stopped.
pub struct ContextTimer {
    id: TimerId,
    interval: IntervalFunc,
    callback: TimerCallback,
    running: Mutex<Option<Running>>,
}

impl ContextTimer {
    /// Create a stopped timer.
    pub fn new(id: TimerId, interval: IntervalFunc, callback: TimerCallback) -> Self {
        Self {
            id,
            interval,
            callback,
            running: Mutex::new(None),
        }
    }

    /// Timer id.
    pub fn id(&self) -> &TimerId {
        &self.id
    }

    /// Whether the timer task is running.
    pub fn is_started(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    /// Start the timer. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if let Some(r) = running.as_ref() {
            if !r.handle.is_finished() {
                return false;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            self.id.clone(),
            self.interval.clone(),
            self.callback.clone(),
            cancel.clone(),
        ));

        *running = Some(Running { cancel, handle });
        trace!(id = %self.id, "timer started");
        true
    }

    /// Stop the timer. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(r) => {
                r.cancel.cancel();
                r.handle.abort();
                trace!(id = %self.id, "timer stopped");
                true
            }
            None => false,
        }
    }
}

impl Drop for ContextTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(id: TimerId, interval: IntervalFunc, callback: TimerCallback, cancel: CancellationToken) {
    let mut count = 0u64;

    loop {
        let wait = interval(count);
        if wait < Duration::from_nanos(1) {
            warn!(id = %id, count, error = %TimerError::InvalidInterval(wait), "timer stopped");
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        match callback(count).await {
            Ok(true) => {}
            Ok(false) | Err(TimerError::Stop) => {
                debug!(id = %id, count, "timer finished");
                return;
            }
            Err(e) => {
                warn!(id = %id, count, error = %e, "timer callback failed; timer stopped");
                return;
            }
        }

        count += 1;
    }
}
