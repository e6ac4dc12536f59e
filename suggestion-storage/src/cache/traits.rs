//! Cache backend trait.
//!
//! The primitives mirror a networked key-value cache: sets, score-sorted
//! sets, hashes, and per-key expiry. Every call may fail transiently.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use suggestion_core::StoreError;

use super::keys::CacheKey;

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations must be thread-safe. Writing to a collection creates the
/// key; removing its last member deletes the key. Expired keys behave as if
/// absent.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Add members to a set. Returns how many were new.
    async fn set_add(&self, key: &CacheKey, members: &[String]) -> Result<u64, StoreError>;

    async fn set_members(&self, key: &CacheKey) -> Result<Vec<String>, StoreError>;

    /// Remove members from a set. Returns how many were present.
    async fn set_remove(&self, key: &CacheKey, members: &[String]) -> Result<u64, StoreError>;

    /// Add or rescore members of a sorted set. Returns how many were new.
    async fn sorted_add(&self, key: &CacheKey, entries: &[(String, f64)])
        -> Result<u64, StoreError>;

    /// Number of members in a sorted set.
    async fn sorted_card(&self, key: &CacheKey) -> Result<u64, StoreError>;

    /// Members by rank, ascending by score (ties by member), inclusive
    /// `start..=stop`. Negative ranks count from the end.
    async fn sorted_range(
        &self,
        key: &CacheKey,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    /// Remove members from a sorted set. Returns how many were present.
    async fn sorted_remove(&self, key: &CacheKey, members: &[String]) -> Result<u64, StoreError>;

    /// Set hash fields. Returns how many were new.
    async fn hash_set(&self, key: &CacheKey, entries: &[(String, String)])
        -> Result<u64, StoreError>;

    async fn hash_get_all(&self, key: &CacheKey) -> Result<HashMap<String, String>, StoreError>;

    /// Delete hash fields. Returns how many were present.
    async fn hash_delete(&self, key: &CacheKey, fields: &[String]) -> Result<u64, StoreError>;

    /// Set the time to live. Returns false if the key does not exist.
    async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining time to live, or `None` if the key is absent or persistent.
    async fn ttl(&self, key: &CacheKey) -> Result<Option<Duration>, StoreError>;

    /// Delete whole keys. Returns how many existed.
    async fn delete(&self, keys: &[CacheKey]) -> Result<u64, StoreError>;

    /// Get cache statistics.
    async fn stats(&self) -> Result<CacheStats, StoreError>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Reads that found the key.
    pub hits: u64,
    /// Reads that did not.
    pub misses: u64,
    /// Number of live keys.
    pub entry_count: u64,
    /// Keys dropped because their TTL elapsed.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
