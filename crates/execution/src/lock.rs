//! Advisory resource locks shared across processes.
//!
//! A lock is a row keyed by resource name. Acquisition is one conditional
//! insert, so two processes racing for the same resource get exactly one
//! winner without any coordinator in between.

use async_trait::async_trait;
use portline_core::ResourceLock;
use portline_storage::{LockAttempt, Storage};
use tracing::{debug, info, warn};

use crate::LockError;

/// Tells the lock manager whether a holder's session is over.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Whether `holder` has ended and its locks may be reclaimed.
    async fn has_ended(&self, holder: &str) -> bool;
}

/// Grants and revokes exclusive claims on named resources.
pub struct LockManager<S: Storage> {
    storage: S,
}

impl<S: Storage> LockManager<S> {
    /// Create a lock manager over a store.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Claim `resource` for `holder`, failing at once if anyone holds it.
    pub async fn acquire(&self, resource: &str, holder: &str) -> Result<ResourceLock, LockError> {
        if resource.trim().is_empty() {
            return Err(LockError::Validation("resource name is empty".to_string()));
        }
        if holder.trim().is_empty() {
            return Err(LockError::Validation("holder is empty".to_string()));
        }

        let lock = ResourceLock {
            resource: resource.to_string(),
            holder: holder.to_string(),
            acquired_at: chrono::Utc::now(),
        };

        match self.storage.try_insert_lock(&lock).await? {
            LockAttempt::Acquired(lock) => {
                info!("{} acquired lock on {}", lock.holder, lock.resource);
                Ok(lock)
            }
            LockAttempt::Held(existing) => {
                warn!(
                    "{} denied lock on {}: held by {}",
                    holder, resource, existing.holder
                );
                Err(LockError::Held {
                    resource: existing.resource,
                    holder: existing.holder,
                    acquired_at: existing.acquired_at,
                })
            }
            LockAttempt::Contended => {
                warn!("{} lost a race for {}", holder, resource);
                Err(LockError::Contended(resource.to_string()))
            }
        }
    }

    /// Claim every resource in `resources` for `holder`.
    ///
    /// Resources are taken in sorted order. If any is held, the ones taken
    /// by this call are released before the error is returned.
    pub async fn acquire_all(
        &self,
        resources: &[String],
        holder: &str,
    ) -> Result<Vec<ResourceLock>, LockError> {
        let mut ordered: Vec<&str> = resources.iter().map(String::as_str).collect();
        ordered.sort_unstable();
        ordered.dedup();

        let mut taken = Vec::with_capacity(ordered.len());
        for resource in ordered {
            match self.acquire(resource, holder).await {
                Ok(lock) => taken.push(lock),
                Err(e) => {
                    for lock in &taken {
                        self.storage
                            .delete_lock_held_by(&lock.resource, holder)
                            .await?;
                    }
                    debug!("Rolled back {} locks for {}", taken.len(), holder);
                    return Err(e);
                }
            }
        }

        Ok(taken)
    }

    /// Release a resource. Releasing an unheld resource is a no-op.
    pub async fn release(&self, resource: &str) -> Result<bool, LockError> {
        let removed = self.storage.delete_lock(resource).await?;
        if removed {
            info!("Released lock on {}", resource);
        } else {
            debug!("Release of unheld resource {}", resource);
        }
        Ok(removed)
    }

    /// Current lock on a resource, if any.
    pub async fn get(&self, resource: &str) -> Result<Option<ResourceLock>, LockError> {
        Ok(self.storage.load_lock(resource).await?)
    }

    /// All locks ordered by resource name.
    pub async fn list(&self) -> Result<Vec<ResourceLock>, LockError> {
        Ok(self.storage.list_locks().await?)
    }

    /// Drop every lock. Returns how many were removed.
    pub async fn clear(&self) -> Result<u64, LockError> {
        let removed = self.storage.clear_locks().await?;
        warn!("Cleared {} locks", removed);
        Ok(removed)
    }

    /// Release every lock held by `holder`.
    pub async fn release_holder(&self, holder: &str) -> Result<Vec<ResourceLock>, LockError> {
        let released = self.storage.delete_locks_by_holder(holder).await?;
        if !released.is_empty() {
            info!("Released {} locks held by {}", released.len(), holder);
        }
        Ok(released)
    }

    /// Release locks whose holders have ended, per `sessions`.
    pub async fn sweep(
        &self,
        sessions: &dyn SessionProvider,
    ) -> Result<Vec<ResourceLock>, LockError> {
        let mut released = Vec::new();

        for lock in self.storage.list_locks().await? {
            if !sessions.has_ended(&lock.holder).await {
                continue;
            }
            // Deletes only while the ended holder still owns the row.
            if let Some(stale) = self
                .storage
                .delete_lock_held_by(&lock.resource, &lock.holder)
                .await?
            {
                warn!("Swept stale lock on {} held by {}", stale.resource, stale.holder);
                released.push(stale);
            }
        }

        Ok(released)
    }
}
