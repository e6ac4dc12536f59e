//! Networked cache of not-yet-served candidates.
//!
//! Per experiment the cache holds one set of active sources. Per
//! experiment+source it holds a uuid index scored by generation time and a
//! uuid to payload map. Every store refreshes the TTL on all three keys and
//! then trims the bucket to its most recent entries.
//!
//! There are no locks. Concurrent writers may lose updates and readers may
//! see stale buckets; the processed-suggestion link in the repository is the
//! authority on what has been served.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use suggestion_core::{
    BrokerConfig, Experiment, ExperimentId, SoftCacheError, Source, StoreError, SuggestionId,
    Timestamp, UnprocessedSuggestion,
};
use tokio::time::Instant;

use crate::cache::{CacheBackend, CacheConfig, CacheKey, CachePolicy};

/// Outcome of a best-effort cleanup operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    /// The operation completed; `removed` entries were deleted.
    Done { removed: u64 },
    /// The operation failed and was skipped. Already logged.
    Skipped(SoftCacheError),
}

impl Cleanup {
    pub fn is_done(&self) -> bool {
        matches!(self, Cleanup::Done { .. })
    }

    pub fn removed(&self) -> u64 {
        match self {
            Cleanup::Done { removed } => *removed,
            Cleanup::Skipped(_) => 0,
        }
    }
}

/// Result of a blocking wait. A timeout means "no data yet", never "empty".
#[derive(Debug, Clone, PartialEq)]
pub enum Awaited {
    Ready(Vec<CachedSuggestionRecord>),
    NotYet,
}

/// The cache-resident projection of a candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSuggestionRecord {
    pub uuid: SuggestionId,
    pub source: Source,
    /// Generation time in epoch milliseconds.
    pub score: i64,
    pub suggestion: UnprocessedSuggestion,
}

/// Result of a successful store.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored {
    pub count: usize,
    /// Per-source truncation outcome.
    pub truncation: Vec<(Source, Cleanup)>,
}

/// The suggestion cache.
pub struct SuggestionStore<B: CacheBackend> {
    backend: Arc<B>,
    policy: CachePolicy,
    config: CacheConfig,
    backlog_multiplier: usize,
    default_generation_size: usize,
}

impl<B: CacheBackend> SuggestionStore<B> {
    pub fn new(backend: Arc<B>, config: CacheConfig, broker_config: &BrokerConfig) -> Self {
        Self {
            backend,
            policy: CachePolicy::from_config(&config),
            config,
            backlog_multiplier: broker_config.backlog_multiplier,
            default_generation_size: broker_config.default_generation_size,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Entries a bucket keeps after storing `batch_size` candidates.
    pub fn keep_count(&self, batch_size: usize) -> usize {
        batch_size.max(self.default_generation_size) * self.backlog_multiplier
    }

    /// Write a batch of candidates.
    ///
    /// Groups by source, registers each source as active, writes index and
    /// payload entries, refreshes the bucket TTL, then truncates each bucket.
    /// `timestamp` overrides each candidate's generation time as its score.
    /// Any write failure is returned; truncation failures are not.
    pub async fn store(
        &self,
        experiment_id: ExperimentId,
        suggestions: &[UnprocessedSuggestion],
        timestamp: Option<Timestamp>,
    ) -> Result<Stored, StoreError> {
        if suggestions.is_empty() {
            return Ok(Stored {
                count: 0,
                truncation: Vec::new(),
            });
        }

        let mut groups: BTreeMap<Source, Vec<&UnprocessedSuggestion>> = BTreeMap::new();
        for suggestion in suggestions {
            if suggestion.experiment_id != experiment_id {
                return Err(StoreError::WriteFailed {
                    key: CacheKey::active_sources(experiment_id).encode(),
                    reason: format!(
                        "suggestion {} belongs to experiment {}",
                        suggestion.uuid, suggestion.experiment_id
                    ),
                });
            }
            groups.entry(suggestion.source).or_default().push(suggestion);
        }

        let backend = &*self.backend;
        let ttl = self.config.entry_ttl;
        let sources_key = CacheKey::active_sources(experiment_id);
        let source_names: Vec<String> = groups
            .keys()
            .map(|source| source.as_db_str().to_string())
            .collect();
        {
            let (key, names) = (&sources_key, &source_names);
            self.policy
                .run("set_add", move || backend.set_add(key, names))
                .await?;
        }

        let mut truncation = Vec::with_capacity(groups.len());
        for (source, group) in &groups {
            let [timestamps_key, payloads_key] = CacheKey::bucket(experiment_id, *source);

            let mut payloads = Vec::with_capacity(group.len());
            let mut scores = Vec::with_capacity(group.len());
            for suggestion in group {
                let raw = serde_json::to_string(suggestion).map_err(|e| {
                    StoreError::Serialization {
                        reason: e.to_string(),
                    }
                })?;
                let generated_at = timestamp.unwrap_or(suggestion.generated_at);
                let member = suggestion.uuid.to_string();
                payloads.push((member.clone(), raw));
                scores.push((member, generated_at.timestamp_millis() as f64));
            }

            // Payload first: an index entry without a payload is skipped on
            // read, a payload without an index entry just waits for its TTL.
            {
                let (key, entries) = (&payloads_key, &payloads);
                self.policy
                    .run("hash_set", move || backend.hash_set(key, entries))
                    .await?;
            }
            {
                let (key, entries) = (&timestamps_key, &scores);
                self.policy
                    .run("sorted_add", move || backend.sorted_add(key, entries))
                    .await?;
            }
            for key in [&sources_key, &timestamps_key, &payloads_key] {
                self.policy
                    .run("expire", move || backend.expire(key, ttl))
                    .await?;
            }

            let keep = self.keep_count(group.len());
            truncation.push((*source, self.truncate(experiment_id, *source, keep).await));
        }

        tracing::debug!(
            experiment_id = %experiment_id,
            count = suggestions.len(),
            sources = groups.len(),
            "Stored suggestions"
        );

        Ok(Stored {
            count: suggestions.len(),
            truncation,
        })
    }

    /// Sources currently registered for the experiment, in priority order.
    pub async fn active_sources(&self, experiment_id: ExperimentId) -> Result<Vec<Source>, StoreError> {
        let backend = &*self.backend;
        let key = &CacheKey::active_sources(experiment_id);
        let members = self
            .policy
            .run("set_members", move || backend.set_members(key))
            .await?;

        let mut sources: Vec<Source> = members
            .iter()
            .filter_map(|name| match Source::from_db_str(name) {
                Ok(source) => Some(source),
                Err(e) => {
                    tracing::warn!(
                        experiment_id = %experiment_id,
                        error = %e,
                        "Ignoring unknown source in active-source set"
                    );
                    None
                }
            })
            .collect();
        sources.sort();
        Ok(sources)
    }

    /// Read every cached candidate for the experiment, or for `sources` only.
    ///
    /// Records come back grouped by source in priority order, newest first
    /// within a source. Candidates that no longer validate against the
    /// experiment are dropped from the result but left in the cache. A
    /// failed read of one bucket skips that bucket; a failed read of the
    /// active-source set is returned.
    pub async fn fetch_all(
        &self,
        experiment: &Experiment,
        sources: Option<&[Source]>,
    ) -> Result<Vec<CachedSuggestionRecord>, StoreError> {
        let experiment_id = experiment.experiment_id;
        let mut sources = match sources {
            Some(subset) => subset.to_vec(),
            None => self.active_sources(experiment_id).await?,
        };
        sources.sort();
        sources.dedup();

        let backend = &*self.backend;
        let mut records = Vec::new();
        for source in sources {
            let [timestamps_key, payloads_key] = CacheKey::bucket(experiment_id, source);

            let index = {
                let key = &timestamps_key;
                match self
                    .policy
                    .run("sorted_range", move || backend.sorted_range(key, 0, -1))
                    .await
                {
                    Ok(index) => index,
                    Err(e) => {
                        tracing::warn!(
                            experiment_id = %experiment_id,
                            source = %source,
                            error = %e,
                            "Skipping unreadable suggestion index"
                        );
                        continue;
                    }
                }
            };
            if index.is_empty() {
                continue;
            }

            let payloads = {
                let key = &payloads_key;
                match self
                    .policy
                    .run("hash_get_all", move || backend.hash_get_all(key))
                    .await
                {
                    Ok(payloads) => payloads,
                    Err(e) => {
                        tracing::warn!(
                            experiment_id = %experiment_id,
                            source = %source,
                            error = %e,
                            "Skipping unreadable suggestion payloads"
                        );
                        continue;
                    }
                }
            };

            for (member, score) in index.iter().rev() {
                let Some(raw) = payloads.get(member) else {
                    continue;
                };
                let suggestion: UnprocessedSuggestion = match serde_json::from_str(raw) {
                    Ok(suggestion) => suggestion,
                    Err(e) => {
                        tracing::warn!(
                            experiment_id = %experiment_id,
                            uuid = %member,
                            error = %e,
                            "Skipping undecodable cached suggestion"
                        );
                        continue;
                    }
                };
                if suggestion.experiment_id != experiment_id {
                    continue;
                }
                if let Err(e) = experiment.validate_assignments(&suggestion.assignments) {
                    tracing::debug!(
                        experiment_id = %experiment_id,
                        uuid = %suggestion.uuid,
                        reason = %e,
                        "Dropping cached suggestion that no longer fits the experiment"
                    );
                    continue;
                }
                records.push(CachedSuggestionRecord {
                    uuid: suggestion.uuid,
                    source,
                    score: *score as i64,
                    suggestion,
                });
            }
        }
        Ok(records)
    }

    /// Delete one candidate from its bucket. Removing an absent uuid is a
    /// no-op that reports zero removed.
    pub async fn remove(&self, suggestion: &UnprocessedSuggestion) -> Cleanup {
        let result = self.remove_entries(suggestion).await;

        match result {
            Ok(removed) => Cleanup::Done { removed },
            Err(e) => {
                tracing::warn!(
                    experiment_id = %suggestion.experiment_id,
                    uuid = %suggestion.uuid,
                    error = %e,
                    "Could not remove cached suggestion"
                );
                Cleanup::Skipped(SoftCacheError::RemoveFailed {
                    uuid: suggestion.uuid,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Keep only the `keep` most recent entries of one bucket.
    pub async fn truncate(&self, experiment_id: ExperimentId, source: Source, keep: usize) -> Cleanup {
        let result = self.truncate_entries(experiment_id, source, keep as u64).await;

        match result {
            Ok(removed) => {
                if removed > 0 {
                    tracing::debug!(
                        experiment_id = %experiment_id,
                        source = %source,
                        removed,
                        keep,
                        "Truncated suggestion backlog"
                    );
                }
                Cleanup::Done { removed }
            }
            Err(e) => {
                tracing::warn!(
                    experiment_id = %experiment_id,
                    source = %source,
                    error = %e,
                    "Could not truncate suggestion backlog"
                );
                Cleanup::Skipped(SoftCacheError::TruncateFailed {
                    bucket: source,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn remove_entries(&self, suggestion: &UnprocessedSuggestion) -> Result<u64, StoreError> {
        let [timestamps_key, payloads_key] =
            CacheKey::bucket(suggestion.experiment_id, suggestion.source);
        let backend = &*self.backend;
        let members = &vec![suggestion.uuid.to_string()];

        let key = &timestamps_key;
        let removed = self
            .policy
            .run("sorted_remove", move || backend.sorted_remove(key, members))
            .await?;
        let key = &payloads_key;
        self.policy
            .run("hash_delete", move || backend.hash_delete(key, members))
            .await?;
        Ok(removed)
    }

    async fn truncate_entries(
        &self,
        experiment_id: ExperimentId,
        source: Source,
        keep: u64,
    ) -> Result<u64, StoreError> {
        let [timestamps_key, payloads_key] = CacheKey::bucket(experiment_id, source);
        let backend = &*self.backend;

        let key = &timestamps_key;
        let count = self
            .policy
            .run("sorted_card", move || backend.sorted_card(key))
            .await?;
        if count <= keep {
            return Ok(0);
        }

        // Ascending by score: the first `excess` ranks are the oldest.
        let excess = (count - keep) as i64;
        let stale: Vec<String> = self
            .policy
            .run("sorted_range", move || backend.sorted_range(key, 0, excess - 1))
            .await?
            .into_iter()
            .map(|(member, _)| member)
            .collect();

        let stale = &stale;
        let removed = self
            .policy
            .run("sorted_remove", move || backend.sorted_remove(key, stale))
            .await?;
        let key = &payloads_key;
        self.policy
            .run("hash_delete", move || backend.hash_delete(key, stale))
            .await?;
        Ok(removed)
    }

    /// Poll until candidates appear or `timeout` elapses.
    pub async fn await_suggestions(
        &self,
        experiment: &Experiment,
        sources: Option<&[Source]>,
        timeout: Duration,
    ) -> Awaited {
        let deadline = Instant::now() + timeout;
        loop {
            match self.fetch_all(experiment, sources).await {
                Ok(records) if !records.is_empty() => return Awaited::Ready(records),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(
                        experiment_id = %experiment.experiment_id,
                        error = %e,
                        "Suggestion wait read failed"
                    );
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Awaited::NotYet;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Drop every bucket of an experiment. Returns the number of keys removed.
    pub async fn invalidate_experiment(&self, experiment_id: ExperimentId) -> Cleanup {
        let mut keys = vec![CacheKey::active_sources(experiment_id)];
        for source in Source::ALL {
            keys.extend(CacheKey::bucket(experiment_id, source));
        }
        let backend = &*self.backend;
        let keys = &keys;

        match self
            .policy
            .run("delete", move || backend.delete(keys))
            .await
        {
            Ok(removed) => {
                tracing::info!(
                    experiment_id = %experiment_id,
                    removed,
                    "Invalidated suggestion cache"
                );
                Cleanup::Done { removed }
            }
            Err(e) => {
                tracing::warn!(
                    experiment_id = %experiment_id,
                    error = %e,
                    "Could not invalidate suggestion cache"
                );
                Cleanup::Skipped(SoftCacheError::InvalidateFailed {
                    experiment_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Number of indexed entries in one bucket.
    pub async fn bucket_len(&self, experiment_id: ExperimentId, source: Source) -> Result<u64, StoreError> {
        let backend = &*self.backend;
        let key = &CacheKey::timestamps(experiment_id, source);
        self.policy
            .run("sorted_card", move || backend.sorted_card(key))
            .await
    }

    /// Remaining TTL of one bucket's index.
    pub async fn bucket_ttl(
        &self,
        experiment_id: ExperimentId,
        source: Source,
    ) -> Result<Option<Duration>, StoreError> {
        let backend = &*self.backend;
        let key = &CacheKey::timestamps(experiment_id, source);
        self.policy.run("ttl", move || backend.ttl(key)).await
    }
}
