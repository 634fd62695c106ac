//! Per-message failure history.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use relaybus_core::{BusError, BusResult, Clock, ExceptionInfo, HandlerError};

use super::exception_info::ExceptionInfoFactory;
use super::settings::RetryStrategySettings;

/// Tracks failures per message id.
///
/// Implementations must be safe under concurrent access to both different
/// and identical ids. Storage failures surface as `BusError`s and abort the
/// receive attempt that hit them.
pub trait ErrorTracker: Send + Sync {
    /// Append a captured failure, creating the record if absent.
    fn register_error(&self, message_id: &str, error: HandlerError) -> BusResult<()>;

    /// Number of tracked failures (0 for unknown ids).
    fn failure_count(&self, message_id: &str) -> BusResult<usize>;

    /// True iff the tracked failure count has reached the threshold.
    fn has_failed_too_many_times(&self, message_id: &str) -> BusResult<bool>;

    /// Tracked failures, oldest first; empty for unknown ids.
    fn exceptions(&self, message_id: &str) -> BusResult<Vec<ExceptionInfo>>;

    /// Forget everything about `message_id`.
    fn clean_up(&self, message_id: &str) -> BusResult<()>;

    /// Drop records whose newest failure is older than the configured max age.
    /// Returns the number of records removed.
    fn prune_expired(&self) -> BusResult<usize>;

    /// All tracked failures rendered as one text block.
    fn error_description(&self, message_id: &str) -> BusResult<String> {
        let exceptions = self.exceptions(message_id)?;
        Ok(exceptions
            .iter()
            .map(ExceptionInfo::full_description)
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

impl<T> ErrorTracker for Arc<T>
where
    T: ErrorTracker + ?Sized,
{
    fn register_error(&self, message_id: &str, error: HandlerError) -> BusResult<()> {
        (**self).register_error(message_id, error)
    }

    fn failure_count(&self, message_id: &str) -> BusResult<usize> {
        (**self).failure_count(message_id)
    }

    fn has_failed_too_many_times(&self, message_id: &str) -> BusResult<bool> {
        (**self).has_failed_too_many_times(message_id)
    }

    fn exceptions(&self, message_id: &str) -> BusResult<Vec<ExceptionInfo>> {
        (**self).exceptions(message_id)
    }

    fn clean_up(&self, message_id: &str) -> BusResult<()> {
        (**self).clean_up(message_id)
    }

    fn prune_expired(&self) -> BusResult<usize> {
        (**self).prune_expired()
    }
}

/// Failure history of one message id.
#[derive(Debug, Clone, Default)]
pub struct ErrorRecord {
    exceptions: Vec<ExceptionInfo>,
}

impl ErrorRecord {
    pub fn exceptions(&self) -> &[ExceptionInfo] {
        &self.exceptions
    }

    pub fn len(&self) -> usize {
        self.exceptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exceptions.is_empty()
    }

    fn newest(&self) -> Option<&ExceptionInfo> {
        self.exceptions.last()
    }
}

/// In-process error tracker.
///
/// Records are pruned as a whole, never entry by entry, so a record only
/// grows until it is cleaned up or expires. Pruning runs inline on every
/// `register_error` and whenever `prune_expired` is called.
pub struct InMemoryErrorTracker {
    max_delivery_attempts: usize,
    max_age: chrono::Duration,
    factory: Arc<dyn ExceptionInfoFactory>,
    clock: Arc<dyn Clock>,
    records: RwLock<HashMap<String, ErrorRecord>>,
}

impl InMemoryErrorTracker {
    pub fn new(
        settings: &RetryStrategySettings,
        factory: Arc<dyn ExceptionInfoFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            max_delivery_attempts: settings.max_delivery_attempts() as usize,
            max_age: chrono::Duration::from_std(settings.error_record_max_age())
                .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)),
            factory,
            clock,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of message ids currently tracked.
    pub fn tracked_ids(&self) -> BusResult<usize> {
        Ok(self.read()?.len())
    }

    fn read(&self) -> BusResult<RwLockReadGuard<'_, HashMap<String, ErrorRecord>>> {
        self.records
            .read()
            .map_err(|_| BusError::Poisoned("error tracker"))
    }

    fn write(&self) -> BusResult<RwLockWriteGuard<'_, HashMap<String, ErrorRecord>>> {
        self.records
            .write()
            .map_err(|_| BusError::Poisoned("error tracker"))
    }

    fn prune_locked(&self, records: &mut HashMap<String, ErrorRecord>) -> usize {
        let now = self.clock.now();
        let before = records.len();
        records.retain(|_, record| {
            record
                .newest()
                .is_some_and(|newest| now.signed_duration_since(newest.time()) <= self.max_age)
        });
        before - records.len()
    }
}

impl ErrorTracker for InMemoryErrorTracker {
    fn register_error(&self, message_id: &str, error: HandlerError) -> BusResult<()> {
        // Capture outside the lock; rendering a backtrace can be slow.
        let info = self.factory.create_info(error);

        let mut records = self.write()?;
        let pruned = self.prune_locked(&mut records);
        if pruned > 0 {
            debug!(pruned, "pruned expired error records");
        }

        let record = records.entry(message_id.to_string()).or_default();
        record.exceptions.push(info);

        debug!(
            message_id,
            failures = record.len(),
            max_delivery_attempts = self.max_delivery_attempts,
            "registered message failure"
        );
        Ok(())
    }

    fn failure_count(&self, message_id: &str) -> BusResult<usize> {
        Ok(self.read()?.get(message_id).map_or(0, ErrorRecord::len))
    }

    fn has_failed_too_many_times(&self, message_id: &str) -> BusResult<bool> {
        Ok(self.failure_count(message_id)? >= self.max_delivery_attempts)
    }

    fn exceptions(&self, message_id: &str) -> BusResult<Vec<ExceptionInfo>> {
        Ok(self
            .read()?
            .get(message_id)
            .map(|record| record.exceptions.clone())
            .unwrap_or_default())
    }

    fn clean_up(&self, message_id: &str) -> BusResult<()> {
        self.write()?.remove(message_id);
        Ok(())
    }

    fn prune_expired(&self) -> BusResult<usize> {
        let mut records = self.write()?;
        Ok(self.prune_locked(&mut records))
    }
}
