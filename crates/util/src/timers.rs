//! Registry of named timers.
//!
//! State handlers keep their ballot timers here. Starting a set of timers can
//! stop every other timer in the same call, which keeps mutually exclusive
//! timers (INIT, ACCEPT, suffrage-confirm ballots) from running together.

use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

use crate::{ContextTimer, TimerError};

/// Timer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerId(Cow<'static, str>);

impl TimerId {
    /// Create an id from a static name.
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named timers; only ids given at construction are accepted unless
/// `allow_unknown` is set.
pub struct Timers {
    ids: HashSet<TimerId>,
    allow_unknown: bool,
    timers: Mutex<HashMap<TimerId, ContextTimer>>,
}

impl Timers {
    /// Create a registry.
    pub fn new(ids: &[TimerId], allow_unknown: bool) -> Self {
        Self {
            ids: ids.iter().cloned().collect(),
            allow_unknown,
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, id: &TimerId) -> Result<(), TimerError> {
        if self.allow_unknown || self.ids.contains(id) {
            Ok(())
        } else {
            Err(TimerError::UnknownTimer(id.clone()))
        }
    }

    /// Register a timer, stopping any previous timer with the same id.
    pub fn set_timer(&self, timer: ContextTimer) -> Result<(), TimerError> {
        self.check(timer.id())?;

        if let Some(old) = self.timers.lock().insert(timer.id().clone(), timer) {
            old.stop();
        }
        Ok(())
    }

    /// Start the given timers; with `stop_others`, stop every other timer.
    pub fn start_timers(&self, ids: &[TimerId], stop_others: bool) -> Result<(), TimerError> {
        for id in ids {
            self.check(id)?;
        }

        let timers = self.timers.lock();
        if stop_others {
            for (id, timer) in timers.iter() {
                if !ids.contains(id) && timer.stop() {
                    debug!(id = %id, "timer stopped by sibling start");
                }
            }
        }

        for id in ids {
            if let Some(timer) = timers.get(id) {
                timer.start();
            }
        }
        Ok(())
    }

    /// Stop the given timers.
    pub fn stop_timers(&self, ids: &[TimerId]) {
        let timers = self.timers.lock();
        for id in ids {
            if let Some(timer) = timers.get(id) {
                timer.stop();
            }
        }
    }

    /// Stop every timer.
    pub fn stop_all(&self) {
        for timer in self.timers.lock().values() {
            timer.stop();
        }
    }

    /// Whether the timer is running.
    pub fn is_started(&self, id: &TimerId) -> bool {
        self.timers
            .lock()
            .get(id)
            .map(|t| t.is_started())
            .unwrap_or(false)
    }

    /// Ids of running timers.
    pub fn started(&self) -> Vec<TimerId> {
        self.timers
            .lock()
            .iter()
            .filter(|(_, t)| t.is_started())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IntervalFunc, TimerCallback};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    const A: TimerId = TimerId::new("a");
    const B: TimerId = TimerId::new("b");

    fn forever(id: TimerId) -> ContextTimer {
        let interval: IntervalFunc = Arc::new(|_| Duration::from_millis(5));
        let callback: TimerCallback = Arc::new(|_| Box::pin(async { Ok(true) }));
        ContextTimer::new(id, interval, callback)
    }

    #[tokio::test]
    async fn test_unknown_timer_rejected() {
        let timers = Timers::new(&[A], false);
        assert_eq!(
            timers.set_timer(forever(B)).unwrap_err(),
            TimerError::UnknownTimer(B)
        );
        assert!(timers.start_timers(&[B], true).is_err());

        let open = Timers::new(&[], true);
        assert!(open.set_timer(forever(B)).is_ok());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_start_stops_others() {
        let timers = Timers::new(&[A, B], false);
        timers.set_timer(forever(A)).unwrap();
        timers.set_timer(forever(B)).unwrap();

        timers.start_timers(&[A], true).unwrap();
        assert!(timers.is_started(&A));
        assert!(!timers.is_started(&B));

        timers.start_timers(&[B], true).unwrap();
        assert!(!timers.is_started(&A));
        assert!(timers.is_started(&B));
        assert_eq!(timers.started(), vec![B]);

        timers.stop_all();
        assert!(timers.started().is_empty());
        assert!(logs_contain("timer stopped by sibling start"));
    }
}
