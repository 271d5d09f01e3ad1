//! # Fast Cache Module
//!
//! ## Purpose
//! Volatile, low-latency key-value substrate mirroring hot entries from the
//! result store and backing the distributed lock. Contents are lost on process
//! restart; nothing here is a source of truth.
//!
//! ## Input/Output Specification
//! - **Input**: Serialized counter values and lock tokens with TTLs
//! - **Output**: Byte payloads, atomic set-if-absent and compare-and-delete
//! - **Backends**: In-process map today; the trait leaves room for Redis
//!
//! The store is injected wherever it is used, never reached through a global,
//! so tests can substitute their own implementation.

use crate::errors::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Volatile cache substrate shared by the fast cache tier and the lock manager.
///
/// All operations may fail (a networked backend can be down); callers are
/// expected to degrade rather than propagate where a slower path exists.
#[async_trait]
pub trait VolatileStore: Send + Sync {
    /// Fetch a payload; expired entries read as absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a payload, replacing any existing entry
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Atomically store a payload only if the key is absent (or expired).
    /// Returns true when the write happened.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    /// Remove an entry; returns true when one existed
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Remove an entry only when its payload equals `expected`.
    /// Returns true when the removal happened.
    async fn remove_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    payload: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(payload: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            payload,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process volatile store over a concurrent map with per-entry TTLs
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of live (unexpired) entries; used by statistics
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.value().is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolatileStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.payload.clone()));
            }
        }
        // Lazy cleanup of expired entries
        self.entries.remove_if(key, |_, v| v.is_expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredEntry::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredEntry::new(value, Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn remove_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, v| !v.is_expired() && v.payload == expected)
            .is_some())
    }
}
