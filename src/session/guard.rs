//! Per-conversation admission control.
//!
//! Each session key owns a single-permit semaphore. Holding the permit is holding the
//! session; a [`SessionLock`] gives it back when dropped, so every exit path of a run
//! (including task abort) releases the key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::error::AdmissionError;
use super::SessionKey;

type Slots = Arc<StdMutex<HashMap<SessionKey, Arc<Semaphore>>>>;

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<SessionKey, Arc<Semaphore>>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drop a key's semaphore once nobody holds or waits on it.
fn prune_slot(slots: &Slots, key: &SessionKey) {
    let mut map = lock_slots(slots);
    let idle = map
        .get(key)
        .map(|sem| Arc::strong_count(sem) == 1 && sem.available_permits() == 1)
        .unwrap_or(false);
    if idle {
        map.remove(key);
    }
}

#[derive(Clone, Default)]
pub struct SessionConcurrencyGuard {
    slots: Slots,
}

impl SessionConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the session for `key`.
    ///
    /// A zero `timeout` rejects immediately when the key is held; otherwise waits at
    /// most `timeout` before returning [`AdmissionError::Busy`].
    pub async fn acquire(
        &self,
        key: &SessionKey,
        timeout: Duration,
    ) -> Result<SessionLock, AdmissionError> {
        let started = Instant::now();
        let semaphore = {
            let mut map = lock_slots(&self.slots);
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        let permit = if timeout.is_zero() {
            semaphore.try_acquire_owned().ok()
        } else {
            match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_closed)) => None,
                Err(_elapsed) => None,
            }
        };

        match permit {
            Some(permit) => {
                debug!(session = %key, "session lock acquired");
                Ok(SessionLock {
                    key: key.clone(),
                    permit: Some(permit),
                    slots: Arc::clone(&self.slots),
                    acquired_at: Instant::now(),
                })
            }
            None => {
                prune_slot(&self.slots, key);
                let waited = started.elapsed();
                warn!(session = %key, waited_ms = waited.as_millis() as u64, "session busy");
                Err(AdmissionError::Busy {
                    key: key.clone(),
                    waited,
                })
            }
        }
    }

    /// Give a session back. Equivalent to dropping the lock.
    pub fn release(&self, lock: SessionLock) {
        debug!(session = %lock.key(), held_ms = lock.held_for().as_millis() as u64, "session released");
        drop(lock);
    }

    pub fn is_held(&self, key: &SessionKey) -> bool {
        lock_slots(&self.slots)
            .get(key)
            .map(|sem| sem.available_permits() == 0)
            .unwrap_or(false)
    }

    /// Number of sessions currently held.
    pub fn held_count(&self) -> usize {
        lock_slots(&self.slots)
            .values()
            .filter(|sem| sem.available_permits() == 0)
            .count()
    }
}

/// Exclusive hold on one session key.
pub struct SessionLock {
    key: SessionKey,
    permit: Option<OwnedSemaphorePermit>,
    slots: Slots,
    acquired_at: Instant,
}

impl SessionLock {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            prune_slot(&self.slots, &self.key);
            debug!(
                session = %self.key,
                held_ms = self.acquired_at.elapsed().as_millis() as u64,
                "session lock released"
            );
        }
    }
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("key", &self.key)
            .field("held_for", &self.held_for())
            .finish()
    }
}
