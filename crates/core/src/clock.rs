//! Time capability injected into components that measure age or wait.
//!
//! Components never call `Utc::now()` or `thread::sleep` directly; they go
//! through a `Clock`, so tests can drive time deterministically.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cancel::CancellationToken;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Wait for `duration`, returning early if `cancel` fires.
    fn sleep(&self, duration: Duration, cancel: &CancellationToken);
}

/// Wall-clock time and real sleeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancellationToken) {
        if duration.is_zero() {
            return;
        }
        cancel.wait_timeout(duration);
    }
}

/// Manually driven clock for tests.
///
/// `sleep` advances the clock by the requested duration and returns at once,
/// and every requested sleep is recorded.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                sleeps: Vec::new(),
            }),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.now += to_chrono(by);
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.lock().now = now;
    }

    /// Sleeps requested so far, oldest first.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    fn sleep(&self, duration: Duration, _cancel: &CancellationToken) {
        let mut state = self.lock();
        state.now += to_chrono(duration);
        state.sleeps.push(duration);
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

impl<C> Clock for std::sync::Arc<C>
where
    C: Clock + ?Sized,
{
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancellationToken) {
        (**self).sleep(duration, cancel)
    }
}
