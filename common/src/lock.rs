// Job locking
//
// Prevents a job from being launched while a previous run of the same job is
// still in flight. Locks carry a TTL so a crashed holder cannot block the job
// forever.

use crate::errors::LockError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Lock trait for ensuring exclusive access to a job
#[async_trait]
pub trait JobLock: Send + Sync {
    /// Acquire a lock on the specified resource with a TTL
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError>;
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    token: Uuid,
    expires_at: Instant,
}

type LockTable = Arc<Mutex<HashMap<String, LockEntry>>>;

fn table(locks: &LockTable) -> MutexGuard<'_, HashMap<String, LockEntry>> {
    // A panic while holding the table cannot leave an entry half-written.
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lock guard that releases the lock when dropped
#[derive(Debug)]
pub struct LockGuard {
    resource: String,
    token: Uuid,
    locks: LockTable,
    acquired_at: Instant,
}

impl LockGuard {
    /// Get the resource name this lock guards
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Get the time elapsed since lock acquisition
    pub fn elapsed(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut locks = table(&self.locks);
        match locks.get(&self.resource) {
            Some(entry) if entry.token == self.token => {
                locks.remove(&self.resource);
                debug!(resource = %self.resource, "Lock released");
            }
            _ => {
                warn!(
                    resource = %self.resource,
                    "Lock was not owned or already expired"
                );
            }
        }
    }
}

/// In-process lock table
#[derive(Debug, Clone, Default)]
pub struct LocalLock {
    locks: LockTable,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live lock is held for `resource`
    pub fn is_locked(&self, resource: &str) -> bool {
        table(&self.locks)
            .get(resource)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }
}

#[async_trait]
impl JobLock for LocalLock {
    #[instrument(skip(self), fields(resource = %resource, ttl_seconds = ttl.as_secs()))]
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let now = Instant::now();
        let mut locks = table(&self.locks);

        if let Some(entry) = locks.get(resource) {
            if entry.expires_at > now {
                return Err(LockError::AlreadyHeld(resource.to_string()));
            }
            warn!("Taking over expired lock");
        }

        let token = Uuid::new_v4();
        locks.insert(
            resource.to_string(),
            LockEntry {
                token,
                expires_at: now + ttl,
            },
        );
        debug!(lock_token = %token, "Lock acquired");

        Ok(LockGuard {
            resource: resource.to_string(),
            token,
            locks: Arc::clone(&self.locks),
            acquired_at: now,
        })
    }
}
