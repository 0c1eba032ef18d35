use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{DataError, DataResult};
use crate::key::ExpiryScope;

/// Default period of the background sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(1000);

// Deadlines past the end of `Instant` are clamped to this horizon.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(start: Instant, ttl: Duration) -> Instant {
    start
        .checked_add(ttl)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Absolute deadlines for expiring fields, per entity.
///
/// A field with no deadline, or whose deadline has passed, is expired.
/// Reads check the clock directly; [`ExpirationTracker::sweep`] only
/// reclaims memory and reports what lapsed.
#[derive(Default)]
pub struct ExpirationTracker {
    deadlines: DashMap<ExpiryScope, HashMap<Arc<str>, Instant>>,
}

impl ExpirationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or overwrite the deadline to `now + ttl`.
    pub fn set_expiration(&self, scope: &ExpiryScope, field: &str, ttl: Duration) {
        let deadline = deadline_after(Instant::now(), ttl);
        self.deadlines
            .entry(scope.clone())
            .or_default()
            .insert(Arc::from(field), deadline);
    }

    pub fn is_expired(&self, scope: &ExpiryScope, field: &str) -> bool {
        self.time_remaining(scope, field).is_none()
    }

    /// Time left before the field lapses, or `None` if it already has.
    pub fn time_remaining(&self, scope: &ExpiryScope, field: &str) -> Option<Duration> {
        let fields = self.deadlines.get(scope)?;
        let deadline = *fields.get(field)?;
        let now = Instant::now();
        (deadline > now).then(|| deadline - now)
    }

    /// Push an active deadline back by `extra`.
    pub fn extend(&self, scope: &ExpiryScope, field: &str, extra: Duration) -> DataResult<()> {
        let now = Instant::now();
        let mut fields = self
            .deadlines
            .get_mut(scope)
            .ok_or_else(|| no_active(field))?;
        let deadline = fields
            .get_mut(field)
            .filter(|deadline| **deadline > now)
            .ok_or_else(|| no_active(field))?;
        *deadline = deadline_after(*deadline, extra);
        Ok(())
    }

    /// Remove a deadline. Returns `true` if one was tracked.
    pub fn clear(&self, scope: &ExpiryScope, field: &str) -> bool {
        let removed = self
            .deadlines
            .get_mut(scope)
            .is_some_and(|mut fields| fields.remove(field).is_some());
        self.deadlines.remove_if(scope, |_, fields| fields.is_empty());
        removed
    }

    /// Drop every lapsed deadline and return what was dropped.
    pub fn sweep(&self) -> Vec<(ExpiryScope, Arc<str>)> {
        let now = Instant::now();
        let mut purged = Vec::new();
        self.deadlines.retain(|scope, fields| {
            fields.retain(|field, deadline| {
                let live = *deadline > now;
                if !live {
                    purged.push((scope.clone(), field.clone()));
                }
                live
            });
            !fields.is_empty()
        });
        if !purged.is_empty() {
            debug!(count = purged.len(), "expired fields swept");
        }
        purged
    }

    /// Number of tracked deadlines, lapsed or not.
    pub fn len(&self) -> usize {
        self.deadlines.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn no_active(field: &str) -> DataError {
    DataError::NoActiveExpiration {
        field: field.to_string(),
    }
}

impl std::fmt::Debug for ExpirationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationTracker")
            .field("tracked", &self.len())
            .finish()
    }
}

/// Background thread running a task at a fixed interval until stopped.
///
/// Stopping (explicitly or on drop) wakes the thread immediately and joins
/// it.
pub struct Sweeper {
    signal: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn start(interval: Duration, task: impl Fn() + Send + 'static) -> std::io::Result<Self> {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_signal = signal.clone();
        let handle = thread::Builder::new()
            .name("tally-expiry-sweeper".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "expiry sweeper started");
                let (lock, cvar) = &*thread_signal;
                let mut stopped = lock.lock();
                while !*stopped {
                    cvar.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    MutexGuard::unlocked(&mut stopped, &task);
                }
                info!("expiry sweeper stopped");
            })?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let (lock, cvar) = &*self.signal;
        *lock.lock() = true;
        cvar.notify_all();
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
