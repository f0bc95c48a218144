//! Identifier-tagged distributed lock over a [`KvStore`].
//!
//! A lock is the key `{prefix}:lock:{name}` holding the holder's UUIDv4
//! identifier, always written with an expiry so a crashed holder cannot
//! block others for longer than the lock ttl.
//!
//! ```text
//! UNLOCKED ──acquire (SET NX + ttl)──▶ LOCKED(id)
//! LOCKED(id) ──release (compare-and-delete id)──▶ UNLOCKED
//! LOCKED(id) ──ttl elapses──▶ UNLOCKED
//! ```
//!
//! Release and extend are single [`Script`] evaluations that compare the
//! stored identifier with this instance's, so an instance whose lock
//! expired and was re-acquired elsewhere cannot release or extend the new
//! holder's lock.
//!
//! Dropping an [`acquire`](DistributedLock::acquire) future between
//! attempts leaves no lock state behind.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::kv::{KvStore, Script};

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub prefix: String,
    pub ttl: Duration,
    pub retry_interval: Duration,
    pub retry_times: u32,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            prefix: "ekp".to_string(),
            ttl: Duration::from_secs(30),
            retry_interval: Duration::from_millis(100),
            retry_times: 50,
        }
    }
}

pub struct DistributedLock {
    kv: Arc<dyn KvStore>,
    key: String,
    identifier: String,
    ttl: Duration,
    retry_interval: Duration,
    retry_times: u32,
    acquired: AtomicBool,
}

impl DistributedLock {
    pub fn new(kv: Arc<dyn KvStore>, name: &str, settings: &LockSettings) -> Self {
        Self {
            kv,
            key: format!("{}:lock:{}", settings.prefix, name),
            identifier: Uuid::new_v4().to_string(),
            ttl: settings.ttl,
            retry_interval: settings.retry_interval,
            retry_times: settings.retry_times,
            acquired: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Whether this instance believes it holds the lock. The lock may
    /// still have expired in the store.
    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Try `SET NX` up to `retry_times` times (at least once), sleeping
    /// `retry_interval` between attempts. Returns `false` when every attempt
    /// found the lock held.
    pub async fn acquire(&self) -> Result<bool> {
        let attempts = self.retry_times.max(1);
        for attempt in 1..=attempts {
            if self.kv.set_nx(&self.key, &self.identifier, self.ttl).await? {
                self.acquired.store(true, Ordering::SeqCst);
                debug!(key = %self.key, attempt, "lock acquired");
                return Ok(true);
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
        debug!(key = %self.key, attempts, "lock not acquired");
        Ok(false)
    }

    /// Delete the lock if it still carries this instance's identifier.
    /// A no-op returning `false` when this instance never acquired it.
    /// On a store error the instance still counts as holding the lock, so
    /// the release can be retried.
    pub async fn release(&self) -> Result<bool> {
        if !self.is_acquired() {
            return Ok(false);
        }
        let released = self
            .kv
            .eval(&Script::CompareAndDelete {
                key: self.key.clone(),
                expected: self.identifier.clone(),
            })
            .await?
            == 1;
        self.acquired.store(false, Ordering::SeqCst);
        if !released {
            warn!(key = %self.key, "lock expired before release");
        }
        Ok(released)
    }

    /// Reset the lock's expiry to `ttl + additional` if this instance still
    /// holds it.
    pub async fn extend(&self, additional: Duration) -> Result<bool> {
        if !self.is_acquired() {
            return Ok(false);
        }
        let extended = self
            .kv
            .eval(&Script::CompareAndExpire {
                key: self.key.clone(),
                expected: self.identifier.clone(),
                ttl: self.ttl + additional,
            })
            .await?;
        Ok(extended == 1)
    }
}

/// Factory for locks sharing one store and one set of defaults.
pub struct LockService {
    kv: Arc<dyn KvStore>,
    settings: LockSettings,
}

impl LockService {
    pub fn new(kv: Arc<dyn KvStore>, settings: LockSettings) -> Self {
        Self { kv, settings }
    }

    pub fn create_lock(&self, name: &str) -> DistributedLock {
        DistributedLock::new(self.kv.clone(), name, &self.settings)
    }

    pub fn create_lock_with_ttl(&self, name: &str, ttl: Duration) -> DistributedLock {
        let settings = LockSettings {
            ttl,
            ..self.settings.clone()
        };
        DistributedLock::new(self.kv.clone(), name, &settings)
    }

    /// Single acquisition attempt.
    pub async fn try_lock(&self, name: &str) -> Result<Option<DistributedLock>> {
        let settings = LockSettings {
            retry_times: 1,
            ..self.settings.clone()
        };
        let lock = DistributedLock::new(self.kv.clone(), name, &settings);
        Ok(lock.acquire().await?.then_some(lock))
    }

    /// Run `f` while holding `name`. Returns `None` (without calling `f`)
    /// when the lock could not be acquired. The lock is released after `f`
    /// completes, whatever `f` returned. If `f` panics, or this future is
    /// dropped while `f` runs, no release happens and the lock is held
    /// until its ttl elapses.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.create_lock(name);
        if !lock.acquire().await? {
            return Ok(None);
        }
        let out = f().await;
        if let Err(e) = lock.release().await {
            warn!(key = %lock.key(), error = %e, "lock release failed; it will expire");
        }
        Ok(Some(out))
    }
}
