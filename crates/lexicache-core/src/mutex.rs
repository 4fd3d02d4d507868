//! Cross-process mutual exclusion over [`SharedStorage`].
//!
//! The lock is a single JSON `LockRecord` under a well-known key. Acquiring
//! writes a candidate record with a fresh owner id, waits a short settle
//! delay, and re-reads: whoever's id survives owns the lock. Records older
//! than the timeout are reclaimable by anyone, and unparsable records are
//! treated as unlocked.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::LockError;
use crate::storage::SharedStorage;

/// Lock records older than this are considered abandoned.
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;

/// Time between writing a candidate record and checking who won.
/// Must exceed the window in which two writers can race.
const DEFAULT_SETTLE_DELAY_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            acquired_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        Utc::now() - self.acquired_at > timeout
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MutexOptions {
    pub timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
        }
    }
}

/// How `with_mutex` waits out contention.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            retry_delay: Duration::from_millis(100),
        }
    }
}

pub struct CrossTabMutex {
    storage: Arc<dyn SharedStorage>,
    lock_key: String,
    instance_id: String,
    options: MutexOptions,
    /// Owner id of the record this instance last wrote and won with
    owner: Mutex<Option<String>>,
}

impl CrossTabMutex {
    pub fn new(storage: Arc<dyn SharedStorage>, lock_key: impl Into<String>, options: MutexOptions) -> Self {
        Self {
            storage,
            lock_key: lock_key.into(),
            instance_id: format!("{}-{:08x}", std::process::id(), rand::random::<u32>()),
            options,
            owner: Mutex::new(None),
        }
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    fn generate_owner_id(&self) -> String {
        format!("{}-{:016x}", self.instance_id, rand::random::<u64>())
    }

    fn current_owner(&self) -> Option<String> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_owner(&self, owner: Option<String>) {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = owner;
    }

    fn read_record(&self) -> Result<Option<LockRecord>, LockError> {
        match self.storage.get(&self.lock_key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| LockError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    fn clear_record(&self, reason: &str) {
        if let Err(e) = self.storage.remove(&self.lock_key) {
            warn!(key = %self.lock_key, error = %e, reason = reason, "Failed to clear lock record");
        }
    }

    /// Try once to take the lock. Contention is reported as `false`, not as
    /// an error.
    ///
    /// The lock is not re-entrant: an instance that already holds it gets
    /// `false` like any other contender, so a nested `with_mutex` cannot
    /// release the outer critical section.
    pub async fn acquire(&self) -> bool {
        match self.read_record() {
            Ok(Some(record)) if record.is_expired(self.options.timeout) => {
                info!(key = %self.lock_key, owner = %record.owner_id, "Reclaiming expired lock");
                self.clear_record("expired");
            }
            Ok(Some(record)) => {
                if self.current_owner().as_deref() == Some(record.owner_id.as_str()) {
                    debug!(key = %self.lock_key, "Lock already held by this instance");
                } else {
                    debug!(key = %self.lock_key, error = %LockError::Contention, "Lock busy");
                }
                return false;
            }
            Ok(None) => {}
            Err(LockError::Corrupt(detail)) => {
                warn!(key = %self.lock_key, detail = %detail, "Corrupt lock record, treating as unlocked");
                self.clear_record("corrupt");
            }
            Err(e) => {
                warn!(key = %self.lock_key, error = %e, "Failed to read lock record");
                return false;
            }
        }

        let candidate = LockRecord::new(self.generate_owner_id());
        let raw = match serde_json::to_string(&candidate) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to serialize lock record");
                return false;
            }
        };
        if let Err(e) = self.storage.set(&self.lock_key, &raw) {
            warn!(key = %self.lock_key, error = %e, "Failed to write lock record");
            return false;
        }

        tokio::time::sleep(self.options.settle_delay).await;

        match self.read_record() {
            Ok(Some(record)) if record.owner_id == candidate.owner_id => {
                debug!(key = %self.lock_key, owner = %candidate.owner_id, "Lock acquired");
                self.set_owner(Some(candidate.owner_id));
                true
            }
            Ok(_) => {
                debug!(key = %self.lock_key, "Lost lock race");
                false
            }
            Err(e) => {
                warn!(key = %self.lock_key, error = %e, "Failed to verify lock record");
                false
            }
        }
    }

    /// Release the lock if this instance owns it. Someone else's record is
    /// left alone.
    pub fn release(&self) {
        let Some(owner) = self.current_owner() else {
            return;
        };
        match self.read_record() {
            Ok(Some(record)) if record.owner_id == owner => self.clear_record("release"),
            Ok(_) => debug!(key = %self.lock_key, "Lock already taken over, nothing to release"),
            Err(e) => warn!(key = %self.lock_key, error = %e, "Failed to read lock record on release"),
        }
        self.set_owner(None);
    }

    pub fn has_lock(&self) -> bool {
        let Some(owner) = self.current_owner() else {
            return false;
        };
        match self.read_record() {
            Ok(Some(record)) => record.owner_id == owner && !record.is_expired(self.options.timeout),
            _ => false,
        }
    }

    /// Clear the lock regardless of who holds it.
    pub fn force_release(&self) {
        warn!(key = %self.lock_key, "Force releasing lock");
        self.clear_record("force");
        self.set_owner(None);
    }

    /// Run `f` while holding the lock.
    ///
    /// Returns `None` when the lock could not be taken within the retry
    /// budget or when `f` fails. The lock is released on every exit path,
    /// including a panic in `f` or the returned future being dropped.
    pub async fn with_mutex<T, E, F, Fut>(&self, f: F, policy: RetryPolicy) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut acquired = false;
        for attempt in 0..=policy.retries {
            if self.acquire().await {
                acquired = true;
                break;
            }
            if attempt < policy.retries {
                debug!(key = %self.lock_key, attempt = attempt + 1, "Waiting for lock");
                tokio::time::sleep(policy.retry_delay).await;
            }
        }
        if !acquired {
            warn!(key = %self.lock_key, retries = policy.retries, "Gave up waiting for lock");
            return None;
        }

        let _guard = ReleaseGuard { mutex: self };
        match f().await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %self.lock_key, error = %e, "Critical section failed");
                None
            }
        }
    }
}

struct ReleaseGuard<'a> {
    mutex: &'a CrossTabMutex,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const KEY: &str = "lexicache:lock:test";

    fn fast_options() -> MutexOptions {
        MutexOptions {
            timeout: Duration::from_secs(10),
            settle_delay: Duration::from_millis(20),
        }
    }

    fn pair() -> (MemoryStorage, CrossTabMutex, CrossTabMutex) {
        let storage = MemoryStorage::new();
        let a = CrossTabMutex::new(Arc::new(storage.clone()), KEY, fast_options());
        let b = CrossTabMutex::new(Arc::new(storage.clone()), KEY, fast_options());
        (storage, a, b)
    }

    #[tokio::test]
    async fn test_racing_acquires_exactly_one_wins() {
        let (_storage, a, b) = pair();
        let (ra, rb) = tokio::join!(a.acquire(), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            b.acquire().await
        });
        assert!(ra ^ rb, "exactly one acquire must succeed");
        assert!(a.has_lock() ^ b.has_lock());

        // Loser can take it after the winner releases
        let (winner, loser) = if ra { (&a, &b) } else { (&b, &a) };
        winner.release();
        assert!(!winner.has_lock());
        assert!(loser.acquire().await);
        assert!(loser.has_lock());
    }

    #[tokio::test]
    async fn test_overwritten_candidate_loses() {
        let (storage, a, _b) = pair();
        let hijack = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            storage
                .set(KEY, &serde_json::to_string(&LockRecord::new("someone-else")).unwrap())
                .unwrap();
        };
        let (won, ()) = tokio::join!(a.acquire(), hijack);
        assert!(!won);
        assert!(!a.has_lock());
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimable() {
        let (storage, a, _b) = pair();
        let stale = LockRecord {
            owner_id: "crashed-tab".to_string(),
            acquired_at: Utc::now() - chrono::Duration::seconds(60),
        };
        storage.set(KEY, &serde_json::to_string(&stale).unwrap()).unwrap();
        assert!(a.acquire().await);
    }

    #[tokio::test]
    async fn test_corrupt_lock_is_treated_as_unlocked() {
        let (storage, a, _b) = pair();
        storage.set(KEY, "not json at all").unwrap();
        assert!(a.acquire().await);
        assert!(a.has_lock());
    }

    #[tokio::test]
    async fn test_release_leaves_foreign_lock_alone() {
        let (storage, a, b) = pair();
        assert!(a.acquire().await);
        b.release();
        assert!(a.has_lock());

        a.force_release();
        assert_eq!(storage.get(KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_with_mutex_releases_after_error() {
        let (storage, a, _b) = pair();
        let result: Option<u32> = a
            .with_mutex(|| async { Err::<u32, _>("boom") }, RetryPolicy::default())
            .await;
        assert_eq!(result, None);
        assert_eq!(storage.get(KEY).unwrap(), None);

        let result = a
            .with_mutex(|| async { Ok::<_, String>(7) }, RetryPolicy::default())
            .await;
        assert_eq!(result, Some(7));
        assert!(!a.has_lock());
    }

    #[tokio::test]
    async fn test_with_mutex_releases_after_panic() {
        let storage = MemoryStorage::new();
        let a = Arc::new(CrossTabMutex::new(Arc::new(storage.clone()), KEY, fast_options()));

        let task = tokio::spawn({
            let a = Arc::clone(&a);
            async move {
                a.with_mutex(
                    || async {
                        if true {
                            panic!("critical section blew up");
                        }
                        Ok::<u32, String>(1)
                    },
                    RetryPolicy::default(),
                )
                .await
            }
        });
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(storage.get(KEY).unwrap(), None);
        assert!(!a.has_lock());
    }

    #[tokio::test]
    async fn test_with_mutex_releases_when_dropped() {
        let (storage, a, b) = pair();
        let entered = std::sync::atomic::AtomicBool::new(false);

        let slow = a.with_mutex(
            || async {
                entered.store(true, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, String>(())
            },
            RetryPolicy::default(),
        );
        assert!(tokio::time::timeout(Duration::from_millis(200), slow).await.is_err());

        assert!(entered.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(storage.get(KEY).unwrap(), None);
        assert!(b.acquire().await);
    }

    #[tokio::test]
    async fn test_nested_with_mutex_keeps_the_outer_lock() {
        let (storage, a, _b) = pair();
        let once = RetryPolicy {
            retries: 0,
            retry_delay: Duration::from_millis(1),
        };

        let result = a
            .with_mutex(
                || async {
                    let inner = a.with_mutex(|| async { Ok::<_, String>(()) }, once).await;
                    Ok::<_, String>((inner, a.has_lock()))
                },
                RetryPolicy::default(),
            )
            .await;
        assert_eq!(result, Some((None, true)));
        assert_eq!(storage.get(KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_with_mutex_gives_up_under_contention() {
        let (_storage, a, b) = pair();
        assert!(a.acquire().await);
        let policy = RetryPolicy {
            retries: 2,
            retry_delay: Duration::from_millis(5),
        };
        let result = b.with_mutex(|| async { Ok::<_, String>(()) }, policy).await;
        assert_eq!(result, None);
        assert!(a.has_lock());
    }
}
