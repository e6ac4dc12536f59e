//! In-memory cache backend.
//!
//! Uses `tokio::sync::RwLock` for safe async access. Expiry is lazy: an
//! expired key is dropped the next time any operation touches it. Faults and
//! latency can be injected so the store's degraded paths are testable.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use suggestion_core::StoreError;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::keys::CacheKey;
use super::traits::{CacheBackend, CacheStats};

/// Backend operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    SetAdd,
    SetMembers,
    SetRemove,
    SortedAdd,
    SortedCard,
    SortedRange,
    SortedRemove,
    HashSet,
    HashGetAll,
    HashDelete,
    Expire,
    Ttl,
    Delete,
}

impl CacheOp {
    fn name(&self) -> &'static str {
        match self {
            CacheOp::SetAdd => "set_add",
            CacheOp::SetMembers => "set_members",
            CacheOp::SetRemove => "set_remove",
            CacheOp::SortedAdd => "sorted_add",
            CacheOp::SortedCard => "sorted_card",
            CacheOp::SortedRange => "sorted_range",
            CacheOp::SortedRemove => "sorted_remove",
            CacheOp::HashSet => "hash_set",
            CacheOp::HashGetAll => "hash_get_all",
            CacheOp::HashDelete => "hash_delete",
            CacheOp::Expire => "expire",
            CacheOp::Ttl => "ttl",
            CacheOp::Delete => "delete",
        }
    }
}

#[derive(Debug)]
enum Value {
    Set(BTreeSet<String>),
    Sorted(HashMap<String, f64>),
    Hash(HashMap<String, String>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Set(s) => s.is_empty(),
            Value::Sorted(s) => s.is_empty(),
            Value::Hash(h) => h.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<CacheKey, Entry>,
    hits: u64,
    misses: u64,
    expirations: u64,
}

impl State {
    /// Drop the key if its TTL has elapsed.
    fn purge_if_expired(&mut self, key: &CacheKey) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
            self.expirations += 1;
        }
    }

    fn live(&mut self, key: &CacheKey) -> Option<&mut Entry> {
        self.purge_if_expired(key);
        let found = self.entries.contains_key(key);
        if found {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.entries.get_mut(key)
    }

    fn drop_if_empty(&mut self, key: &CacheKey) {
        if self.entries.get(key).is_some_and(|e| e.value.is_empty()) {
            self.entries.remove(key);
        }
    }
}

fn wrong_type(key: &CacheKey) -> StoreError {
    StoreError::WriteFailed {
        key: key.encode(),
        reason: "WRONGTYPE operation against a key holding the wrong kind of value".to_string(),
    }
}

/// In-memory [`CacheBackend`] for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    state: RwLock<State>,
    faults: Mutex<HashMap<CacheOp, u32>>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls of `op` fail with a connection error.
    pub async fn inject_failures(&self, op: CacheOp, count: u32) {
        let mut faults = self.faults.lock().await;
        *faults.entry(op).or_insert(0) += count;
    }

    /// Delay every call by `latency` (`None` to clear).
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().await = latency;
    }

    async fn enter(&self, op: CacheOp) -> Result<(), StoreError> {
        let latency = *self.latency.lock().await;
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        let mut faults = self.faults.lock().await;
        if let Some(remaining) = faults.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Connection {
                    reason: format!("injected failure in {}", op.name()),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn set_add(&self, key: &CacheKey, members: &[String]) -> Result<u64, StoreError> {
        self.enter(CacheOp::SetAdd).await?;
        let mut state = self.state.write().await;
        state.purge_if_expired(key);
        let entry = state.entries.entry(*key).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        let Value::Set(set) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let added = members.iter().filter(|m| set.insert((*m).clone())).count();
        state.drop_if_empty(key);
        Ok(added as u64)
    }

    async fn set_members(&self, key: &CacheKey) -> Result<Vec<String>, StoreError> {
        self.enter(CacheOp::SetMembers).await?;
        let mut state = self.state.write().await;
        match state.live(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &CacheKey, members: &[String]) -> Result<u64, StoreError> {
        self.enter(CacheOp::SetRemove).await?;
        let mut state = self.state.write().await;
        let removed = match state.live(key) {
            None => 0,
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => members.iter().filter(|m| set.remove(*m)).count(),
            Some(_) => return Err(wrong_type(key)),
        };
        state.drop_if_empty(key);
        Ok(removed as u64)
    }

    async fn sorted_add(
        &self,
        key: &CacheKey,
        entries: &[(String, f64)],
    ) -> Result<u64, StoreError> {
        self.enter(CacheOp::SortedAdd).await?;
        let mut state = self.state.write().await;
        state.purge_if_expired(key);
        let entry = state.entries.entry(*key).or_insert_with(|| Entry {
            value: Value::Sorted(HashMap::new()),
            expires_at: None,
        });
        let Value::Sorted(sorted) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let added = entries
            .iter()
            .filter(|(member, score)| sorted.insert(member.clone(), *score).is_none())
            .count();
        state.drop_if_empty(key);
        Ok(added as u64)
    }

    async fn sorted_card(&self, key: &CacheKey) -> Result<u64, StoreError> {
        self.enter(CacheOp::SortedCard).await?;
        let mut state = self.state.write().await;
        match state.live(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::Sorted(sorted),
                ..
            }) => Ok(sorted.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sorted_range(
        &self,
        key: &CacheKey,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.enter(CacheOp::SortedRange).await?;
        let mut state = self.state.write().await;
        let sorted = match state.live(key) {
            None => return Ok(Vec::new()),
            Some(Entry {
                value: Value::Sorted(sorted),
                ..
            }) => sorted,
            Some(_) => return Err(wrong_type(key)),
        };

        let mut ordered: Vec<(String, f64)> =
            sorted.iter().map(|(m, s)| (m.clone(), *s)).collect();
        ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let len = ordered.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(ordered
            .into_iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .collect())
    }

    async fn sorted_remove(&self, key: &CacheKey, members: &[String]) -> Result<u64, StoreError> {
        self.enter(CacheOp::SortedRemove).await?;
        let mut state = self.state.write().await;
        let removed = match state.live(key) {
            None => 0,
            Some(Entry {
                value: Value::Sorted(sorted),
                ..
            }) => members.iter().filter(|m| sorted.remove(*m).is_some()).count(),
            Some(_) => return Err(wrong_type(key)),
        };
        state.drop_if_empty(key);
        Ok(removed as u64)
    }

    async fn hash_set(
        &self,
        key: &CacheKey,
        entries: &[(String, String)],
    ) -> Result<u64, StoreError> {
        self.enter(CacheOp::HashSet).await?;
        let mut state = self.state.write().await;
        state.purge_if_expired(key);
        let entry = state.entries.entry(*key).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let added = entries
            .iter()
            .filter(|(field, value)| hash.insert(field.clone(), value.clone()).is_none())
            .count();
        state.drop_if_empty(key);
        Ok(added as u64)
    }

    async fn hash_get_all(&self, key: &CacheKey) -> Result<HashMap<String, String>, StoreError> {
        self.enter(CacheOp::HashGetAll).await?;
        let mut state = self.state.write().await;
        match state.live(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_delete(&self, key: &CacheKey, fields: &[String]) -> Result<u64, StoreError> {
        self.enter(CacheOp::HashDelete).await?;
        let mut state = self.state.write().await;
        let removed = match state.live(key) {
            None => 0,
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => fields.iter().filter(|f| hash.remove(*f).is_some()).count(),
            Some(_) => return Err(wrong_type(key)),
        };
        state.drop_if_empty(key);
        Ok(removed as u64)
    }

    async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<bool, StoreError> {
        self.enter(CacheOp::Expire).await?;
        let mut state = self.state.write().await;
        match state.live(key) {
            None => Ok(false),
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
        }
    }

    async fn ttl(&self, key: &CacheKey) -> Result<Option<Duration>, StoreError> {
        self.enter(CacheOp::Ttl).await?;
        let mut state = self.state.write().await;
        Ok(state
            .live(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn delete(&self, keys: &[CacheKey]) -> Result<u64, StoreError> {
        self.enter(CacheOp::Delete).await?;
        let mut state = self.state.write().await;
        let mut removed = 0;
        for key in keys {
            state.purge_if_expired(key);
            if state.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats, StoreError> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        state.expirations += (before - state.entries.len()) as u64;
        Ok(CacheStats {
            hits: state.hits,
            misses: state.misses,
            entry_count: state.entries.len() as u64,
            expirations: state.expirations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suggestion_core::{EntityIdType, ExperimentId, Source};

    fn keys() -> (CacheKey, CacheKey, CacheKey) {
        let experiment_id = ExperimentId::now_v7();
        (
            CacheKey::active_sources(experiment_id),
            CacheKey::timestamps(experiment_id, Source::Random),
            CacheKey::payloads(experiment_id, Source::Random),
        )
    }

    fn members(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_add_members_remove() {
        let backend = InMemoryCacheBackend::new();
        let (sources, _, _) = keys();

        assert_eq!(backend.set_add(&sources, &members(&["a", "b"])).await.unwrap(), 2);
        assert_eq!(backend.set_add(&sources, &members(&["b"])).await.unwrap(), 0);
        assert_eq!(backend.set_members(&sources).await.unwrap(), members(&["a", "b"]));
        assert_eq!(backend.set_remove(&sources, &members(&["a", "z"])).await.unwrap(), 1);
        assert_eq!(backend.set_remove(&sources, &members(&["b"])).await.unwrap(), 1);
        assert_eq!(backend.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_sorted_range_orders_by_score() {
        let backend = InMemoryCacheBackend::new();
        let (_, timestamps, _) = keys();
        backend
            .sorted_add(
                &timestamps,
                &[
                    ("c".to_string(), 3.0),
                    ("a".to_string(), 1.0),
                    ("b".to_string(), 2.0),
                    ("d".to_string(), 4.0),
                ],
            )
            .await
            .unwrap();

        let all: Vec<String> = backend
            .sorted_range(&timestamps, 0, -1)
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(all, members(&["a", "b", "c", "d"]));

        let oldest_two: Vec<String> = backend
            .sorted_range(&timestamps, 0, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(oldest_two, members(&["a", "b"]));

        let newest: Vec<String> = backend
            .sorted_range(&timestamps, -1, -1)
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(newest, members(&["d"]));

        assert!(backend.sorted_range(&timestamps, 3, 1).await.unwrap().is_empty());
        assert_eq!(backend.sorted_range(&timestamps, 2, 100).await.unwrap().len(), 2);
        assert_eq!(backend.sorted_card(&timestamps).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_hash_roundtrip_and_delete() {
        let backend = InMemoryCacheBackend::new();
        let (_, _, payloads) = keys();
        backend
            .hash_set(&payloads, &[("u1".to_string(), "{}".to_string())])
            .await
            .unwrap();
        let all = backend.hash_get_all(&payloads).await.unwrap();
        assert_eq!(all.get("u1").map(String::as_str), Some("{}"));
        assert_eq!(backend.hash_delete(&payloads, &members(&["u1", "u2"])).await.unwrap(), 1);
        assert!(backend.hash_get_all(&payloads).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let backend = InMemoryCacheBackend::new();
        let (sources, _, _) = keys();
        backend.set_add(&sources, &members(&["a"])).await.unwrap();
        let err = backend.hash_get_all(&sources).await.unwrap_err();
        assert!(matches!(err, StoreError::WriteFailed { .. }));
    }

    #[tokio::test]
    async fn test_expire_and_lazy_expiry() {
        let backend = InMemoryCacheBackend::new();
        let (sources, _, _) = keys();

        assert!(!backend.expire(&sources, Duration::from_secs(1)).await.unwrap());
        backend.set_add(&sources, &members(&["a"])).await.unwrap();
        assert_eq!(backend.ttl(&sources).await.unwrap(), None);

        assert!(backend.expire(&sources, Duration::from_millis(20)).await.unwrap());
        let remaining = backend.ttl(&sources).await.unwrap().expect("ttl set");
        assert!(remaining <= Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(backend.set_members(&sources).await.unwrap().is_empty());
        assert_eq!(backend.stats().await.unwrap().expirations, 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let backend = InMemoryCacheBackend::new();
        let (sources, _, _) = keys();
        backend.inject_failures(CacheOp::SetMembers, 2).await;

        assert!(backend.set_members(&sources).await.unwrap_err().is_transient());
        assert!(backend.set_members(&sources).await.is_err());
        assert!(backend.set_members(&sources).await.is_ok());
        assert!(backend.set_add(&sources, &members(&["a"])).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_counts_existing_keys() {
        let backend = InMemoryCacheBackend::new();
        let (sources, timestamps, payloads) = keys();
        backend.set_add(&sources, &members(&["random"])).await.unwrap();
        backend
            .sorted_add(&timestamps, &[("u".to_string(), 1.0)])
            .await
            .unwrap();
        assert_eq!(backend.delete(&[sources, timestamps, payloads]).await.unwrap(), 2);
    }
}
