//! # Distributed Lock Module
//!
//! ## Purpose
//! Named, time-bounded mutual exclusion over the volatile cache substrate,
//! used to ensure at most one concurrent recomputation per counter family and
//! one warming pass at a time.
//!
//! ## Design
//! - Acquisition is one atomic set-if-absent; there is no queueing or fairness
//! - TTL is mandatory: expiry is the backstop against a crashed holder
//! - Each acquisition carries a unique token, and release is compare-and-delete
//!   against that token, so a slow holder's late release can never clobber a
//!   newer legitimate holder's lock

use crate::errors::Result;
use crate::fast_cache::VolatileStore;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Namespace prefix separating locks from cached values on the shared substrate
const LOCK_PREFIX: &str = "lock:";

/// Proof of a successful acquisition; required for release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    name: String,
    token: Uuid,
}

impl LockToken {
    /// The lock's name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Manager for named time-bounded locks
pub struct LockManager {
    store: Arc<dyn VolatileStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn VolatileStore>) -> Self {
        Self { store }
    }

    fn storage_key(name: &str) -> String {
        format!("{}{}", LOCK_PREFIX, name)
    }

    /// Attempt to acquire a lock. Returns `None` when another holder has it.
    ///
    /// Never waits: contention is an expected outcome, not an error.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = Uuid::new_v4();
        let acquired = self
            .store
            .set_if_absent(&Self::storage_key(name), token.as_bytes().to_vec(), ttl)
            .await?;

        if acquired {
            tracing::debug!("Acquired lock '{}' (ttl {:?})", name, ttl);
            Ok(Some(LockToken {
                name: name.to_string(),
                token,
            }))
        } else {
            tracing::debug!("Lock '{}' already held", name);
            Ok(None)
        }
    }

    /// Release a previously acquired lock.
    ///
    /// Returns false when the entry no longer matched the token, meaning the
    /// lock expired and was possibly re-acquired; that is logged, not an error.
    pub async fn release(&self, token: LockToken) -> Result<bool> {
        let released = self
            .store
            .remove_if_equal(&Self::storage_key(&token.name), token.token.as_bytes())
            .await?;

        if released {
            tracing::debug!("Released lock '{}'", token.name);
        } else {
            tracing::warn!(
                "Lock '{}' was not released: entry expired or held by another owner",
                token.name
            );
        }

        Ok(released)
    }

    /// Check whether a lock is currently held
    pub async fn is_held(&self, name: &str) -> Result<bool> {
        Ok(self.store.get(&Self::storage_key(name)).await?.is_some())
    }

    /// Clear a lock regardless of owner. Incident recovery only.
    pub async fn force_clear(&self, name: &str) -> Result<bool> {
        let cleared = self.store.remove(&Self::storage_key(name)).await?;
        if cleared {
            tracing::warn!("Lock '{}' forcibly cleared", name);
        }
        Ok(cleared)
    }
}
