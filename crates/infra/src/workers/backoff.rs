//! Worker wait times while idle or after failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use relaybus_core::{BusError, BusResult, CancellationToken, Clock};

/// Chooses and applies worker sleeps. Shared by all workers of a bus.
///
/// Every wait returns early when `cancel` fires and reports the duration it
/// was asked to wait.
pub trait BackoffStrategy: Send + Sync {
    /// No free gate slot.
    fn wait(&self, cancel: &CancellationToken) -> Duration;

    /// Queue was empty; grows with the length of the idle period.
    fn wait_no_message(&self, cancel: &CancellationToken) -> Duration;

    /// After a failed receive or infrastructure error.
    fn wait_error(&self, cancel: &CancellationToken) -> Duration;

    /// A message was received; the next idle period starts from scratch.
    fn reset(&self);
}

/// 100 ms for the first 10 idle seconds, 250 ms for the next 10, then 1 s.
pub fn default_backoff_times() -> Vec<Duration> {
    let mut times = vec![Duration::from_millis(100); 10];
    times.extend(std::iter::repeat_n(Duration::from_millis(250), 10));
    times.push(Duration::from_secs(1));
    times
}

const NOT_IDLE: i64 = i64::MIN;

/// Table-driven backoff: entry `n` applies after `n` idle seconds, the last
/// entry applies from then on.
pub struct DefaultBackoffStrategy {
    backoff_times: Vec<Duration>,
    error_wait: Duration,
    clock: Arc<dyn Clock>,
    idle_since_ms: AtomicI64,
}

impl DefaultBackoffStrategy {
    pub fn new(
        backoff_times: Vec<Duration>,
        error_wait: Duration,
        clock: Arc<dyn Clock>,
    ) -> BusResult<Self> {
        validate_backoff_times(&backoff_times)?;
        Ok(Self {
            backoff_times,
            error_wait,
            clock,
            idle_since_ms: AtomicI64::new(NOT_IDLE),
        })
    }

    pub fn backoff_times(&self) -> &[Duration] {
        &self.backoff_times
    }

    /// Wait for the current idle period without sleeping. Marks the start of
    /// the idle period if none is in progress.
    pub fn next_idle_wait(&self) -> Duration {
        let now = self.clock.now().timestamp_millis();
        let started = match self.idle_since_ms.compare_exchange(
            NOT_IDLE,
            now,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => now,
            Err(existing) => existing,
        };

        let idle_secs = usize::try_from(now.saturating_sub(started) / 1000).unwrap_or(0);
        let index = idle_secs.min(self.backoff_times.len() - 1);
        self.backoff_times[index]
    }

    fn shortest(&self) -> Duration {
        self.backoff_times[0]
    }
}

impl BackoffStrategy for DefaultBackoffStrategy {
    fn wait(&self, cancel: &CancellationToken) -> Duration {
        let wait = self.shortest();
        self.clock.sleep(wait, cancel);
        wait
    }

    fn wait_no_message(&self, cancel: &CancellationToken) -> Duration {
        let wait = self.next_idle_wait();
        self.clock.sleep(wait, cancel);
        wait
    }

    fn wait_error(&self, cancel: &CancellationToken) -> Duration {
        self.clock.sleep(self.error_wait, cancel);
        self.error_wait
    }

    fn reset(&self) {
        self.idle_since_ms.store(NOT_IDLE, Ordering::Release);
    }
}

impl core::fmt::Debug for DefaultBackoffStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DefaultBackoffStrategy")
            .field("backoff_times", &self.backoff_times.len())
            .field("error_wait", &self.error_wait)
            .finish()
    }
}

/// Non-empty and non-decreasing.
pub fn validate_backoff_times(times: &[Duration]) -> BusResult<()> {
    if times.is_empty() {
        return Err(BusError::config("backoff times must not be empty"));
    }
    if times.windows(2).any(|pair| pair[1] < pair[0]) {
        return Err(BusError::config("backoff times must be non-decreasing"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use proptest::prelude::*;
    use relaybus_core::ManualClock;

    fn strategy(times: Vec<Duration>) -> (DefaultBackoffStrategy, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let backoff =
            DefaultBackoffStrategy::new(times, Duration::from_secs(5), clock.clone()).unwrap();
        (backoff, clock)
    }

    #[test]
    fn default_table_grows_with_idle_time() {
        let (backoff, clock) = strategy(default_backoff_times());
        let cancel = CancellationToken::new();

        assert_eq!(backoff.wait_no_message(&cancel), Duration::from_millis(100));
        clock.advance(Duration::from_secs(10));
        assert_eq!(backoff.wait_no_message(&cancel), Duration::from_millis(250));
        clock.advance(Duration::from_secs(60));
        assert_eq!(backoff.wait_no_message(&cancel), Duration::from_secs(1));
    }

    #[test]
    fn reset_starts_over_at_shortest_wait() {
        let (backoff, clock) = strategy(default_backoff_times());
        let cancel = CancellationToken::new();
        backoff.wait_no_message(&cancel);
        clock.advance(Duration::from_secs(30));
        assert_eq!(backoff.wait_no_message(&cancel), Duration::from_secs(1));

        backoff.reset();

        assert_eq!(backoff.wait_no_message(&cancel), Duration::from_millis(100));
    }

    #[test]
    fn error_wait_is_independent_of_idle_table() {
        let (backoff, clock) = strategy(default_backoff_times());
        let cancel = CancellationToken::new();

        assert_eq!(backoff.wait_error(&cancel), Duration::from_secs(5));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);
        assert_eq!(backoff.wait_no_message(&cancel), Duration::from_millis(100));
    }

    #[test]
    fn busy_wait_uses_shortest_entry() {
        let (backoff, _) = strategy(vec![Duration::from_millis(20), Duration::from_secs(2)]);
        assert_eq!(backoff.wait(&CancellationToken::new()), Duration::from_millis(20));
    }

    #[test]
    fn rejects_invalid_tables() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        assert!(DefaultBackoffStrategy::new(Vec::new(), Duration::ZERO, clock.clone()).is_err());
        assert!(
            DefaultBackoffStrategy::new(
                vec![Duration::from_secs(1), Duration::from_millis(1)],
                Duration::ZERO,
                clock,
            )
            .is_err()
        );
    }

    #[test]
    fn shared_between_threads() {
        let (backoff, _) = strategy(default_backoff_times());
        let backoff = Arc::new(backoff);

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let backoff = backoff.clone();
                thread::spawn(move || {
                    let cancel = CancellationToken::new();
                    for i in 0..50 {
                        let wait = backoff.wait_no_message(&cancel);
                        assert!(wait <= Duration::from_secs(1));
                        if i % 10 == 0 {
                            backoff.reset();
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
    }

    fn table() -> impl Strategy<Value = Vec<Duration>> {
        prop::collection::vec(1u64..2_000, 1..12).prop_map(|mut millis| {
            millis.sort_unstable();
            millis.into_iter().map(Duration::from_millis).collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        #[test]
        fn idle_waits_never_decrease_or_exceed_max(times in table(), rounds in 1usize..40) {
            let (backoff, _) = strategy(times.clone());
            let cancel = CancellationToken::new();
            let max = *times.last().unwrap();

            backoff.reset();
            let first = backoff.wait_no_message(&cancel);
            prop_assert_eq!(first, times[0]);

            let mut previous = first;
            for _ in 0..rounds {
                let wait = backoff.wait_no_message(&cancel);
                prop_assert!(wait >= previous);
                prop_assert!(wait <= max);
                previous = wait;
            }
        }
    }
}
