//! Serving orchestration.

use std::sync::Arc;

use suggestion_core::{
    BrokerConfig, Experiment, ExperimentId, OptimizationSnapshot, ProcessedSuggestion,
    QueuedSuggestionId, RequestMeta, Source, SuggestError, SuggestResult, UnprocessedSuggestion,
};
use suggestion_storage::{CacheBackend, Cleanup, Stored, SuggestionRepository, SuggestionStore};
use tracing::{info_span, Instrument};

use crate::conflict::ConflictResolver;
use crate::random::RandomSampler;
use crate::samplers::SamplerTable;
use crate::selector::{SamplerSelector, SelectionPlan, StencilPolicy};

/// Serves one suggestion per call.
///
/// A call first tries the user queue. Without a queued entry it selects a
/// strategy, prefers a cached candidate from that strategy's buckets and
/// otherwise draws one fresh. The chosen candidate is linked to the request
/// in the repository, collisions are repaired, and the candidate is evicted
/// from the cache.
pub struct SuggestionBroker<B: CacheBackend, R: SuggestionRepository> {
    store: Arc<SuggestionStore<B>>,
    repository: Arc<R>,
    selector: SamplerSelector,
    samplers: SamplerTable,
    resolver: ConflictResolver<R>,
    config: BrokerConfig,
}

impl<B: CacheBackend, R: SuggestionRepository> SuggestionBroker<B, R> {
    pub fn new(
        store: Arc<SuggestionStore<B>>,
        repository: Arc<R>,
        samplers: SamplerTable,
        stencil: Arc<dyn StencilPolicy>,
        config: BrokerConfig,
    ) -> SuggestResult<Self> {
        config.validate()?;
        let selector = SamplerSelector::new(stencil)
            .with_require_low_discrepancy_draw(config.require_low_discrepancy_draw);
        let resolver = ConflictResolver::new(
            repository.clone(),
            Arc::new(RandomSampler::new()),
            &config,
        );
        Ok(Self {
            store,
            repository,
            selector,
            samplers,
            resolver,
            config,
        })
    }

    /// Use `random` for conflict replacement draws.
    pub fn with_replacement_sampler(mut self, random: Arc<RandomSampler>) -> Self {
        self.resolver = ConflictResolver::new(self.repository.clone(), random, &self.config);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> &SuggestionStore<B> {
        &self.store
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Serve exactly one suggestion or fail.
    pub async fn serve_suggestion(
        &self,
        experiment: &Experiment,
        meta: &RequestMeta,
    ) -> SuggestResult<ProcessedSuggestion> {
        let span = info_span!(
            "serve_suggestion",
            experiment_id = %experiment.experiment_id,
            request_id = %meta.request_id,
        );
        self.serve(experiment, meta).instrument(span).await
    }

    async fn serve(
        &self,
        experiment: &Experiment,
        meta: &RequestMeta,
    ) -> SuggestResult<ProcessedSuggestion> {
        if let Some(processed) = self.serve_from_queue(experiment, meta).await? {
            return Ok(processed);
        }

        let snapshot = self.load_snapshot(experiment).await?;
        let mut races = 0u32;
        loop {
            let candidate = self.next_candidate(experiment, &snapshot).await?;
            match self.process(experiment, &candidate, meta).await {
                Ok(processed) => {
                    tracing::info!(
                        processed_id = %processed.processed_id,
                        source = %processed.source,
                        "Served suggestion"
                    );
                    return Ok(processed);
                }
                // Another request served the same cached candidate first.
                Err(e) if e.is_duplicate_suggestion() => {
                    races += 1;
                    if races >= self.config.max_queued_suggestion_fetches {
                        tracing::warn!(
                            experiment_id = %experiment.experiment_id,
                            attempts = races,
                            "Suggestion claim retries exhausted"
                        );
                        return Err(SuggestError::CouldNotProcessSuggestion {
                            experiment_id: experiment.experiment_id,
                            attempts: races,
                        });
                    }
                    tracing::debug!(uuid = %candidate.uuid, races, "Cached suggestion already served");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Claim the oldest queued entry. Entries that another request already
    /// claimed are skipped and dropped from the queue; after
    /// `max_queued_suggestion_fetches` claim races the call fails.
    async fn serve_from_queue(
        &self,
        experiment: &Experiment,
        meta: &RequestMeta,
    ) -> SuggestResult<Option<ProcessedSuggestion>> {
        let experiment_id = experiment.experiment_id;
        let ceiling = self.config.max_queued_suggestion_fetches;
        let mut claimed: Vec<QueuedSuggestionId> = Vec::new();

        while (claimed.len() as u32) < ceiling {
            let Some(queued) = self.repository.queued_next(experiment_id, &claimed).await? else {
                return Ok(None);
            };
            let candidate = UnprocessedSuggestion::from_queued(&queued);

            match self.process(experiment, &candidate, meta).await {
                Ok(processed) => {
                    tracing::info!(
                        queued_id = %queued.queued_id,
                        processed_id = %processed.processed_id,
                        "Served queued suggestion"
                    );
                    return Ok(Some(processed));
                }
                Err(e) if e.is_duplicate_suggestion() => {
                    tracing::debug!(
                        queued_id = %queued.queued_id,
                        attempt = claimed.len() + 1,
                        "Queued suggestion claimed by another request"
                    );
                    claimed.push(queued.queued_id);
                    self.drop_served_queue_entry(experiment_id, &candidate).await?;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            experiment_id = %experiment_id,
            attempts = ceiling,
            "Queued suggestion claim retries exhausted"
        );
        Err(SuggestError::CouldNotProcessSuggestion {
            experiment_id,
            attempts: ceiling,
        })
    }

    /// Delete a queued entry whose link already exists. A failed delete is
    /// logged; the entry is retried as a claim race on the next call.
    async fn drop_served_queue_entry(
        &self,
        experiment_id: ExperimentId,
        candidate: &UnprocessedSuggestion,
    ) -> SuggestResult<()> {
        let Some(queued_id) = candidate.queued_id else {
            return Ok(());
        };
        if self
            .repository
            .processed_find_by_uuid(experiment_id, candidate.uuid)
            .await?
            .is_none()
        {
            return Ok(());
        }
        match self.repository.queued_delete(queued_id).await {
            Ok(true) => {
                tracing::debug!(queued_id = %queued_id, "Dropped already served queued suggestion");
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    queued_id = %queued_id,
                    error = %e,
                    "Could not drop already served queued suggestion"
                );
            }
        }
        Ok(())
    }

    /// Persist the link, repair collisions, then clean up the cache entry
    /// and the queue entry.
    async fn process(
        &self,
        experiment: &Experiment,
        candidate: &UnprocessedSuggestion,
        meta: &RequestMeta,
    ) -> SuggestResult<ProcessedSuggestion> {
        let processed = ProcessedSuggestion::serve(candidate, meta);
        self.repository.processed_insert(&processed).await?;

        let processed = self
            .resolver
            .replace_with_random_if_necessary(experiment, &processed)
            .await?;

        if !candidate.is_queue_derived() {
            if let Cleanup::Skipped(e) = self.store.remove(candidate).await {
                tracing::debug!(error = %e, "Served suggestion left in cache");
            }
        }

        if let Some(queued_id) = candidate.queued_id {
            match self.repository.queued_delete(queued_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(queued_id = %queued_id, "Queued suggestion already deleted");
                }
                Err(e) => {
                    tracing::warn!(
                        queued_id = %queued_id,
                        error = %e,
                        "Could not delete served queued suggestion"
                    );
                }
            }
        }

        Ok(processed)
    }

    /// Pick the candidate to serve when the queue is empty.
    async fn next_candidate(
        &self,
        experiment: &Experiment,
        snapshot: &OptimizationSnapshot,
    ) -> SuggestResult<UnprocessedSuggestion> {
        let plan = self.selector.select(experiment, snapshot, 1)?;

        if let Some(cached) = self.take_cached(experiment, snapshot, &plan).await? {
            return Ok(cached);
        }
        self.draw_fresh(experiment, snapshot, &plan).await
    }

    /// Newest usable cached candidate from the plan's buckets.
    async fn take_cached(
        &self,
        experiment: &Experiment,
        snapshot: &OptimizationSnapshot,
        plan: &SelectionPlan,
    ) -> SuggestResult<Option<UnprocessedSuggestion>> {
        let experiment_id = experiment.experiment_id;
        let records = match self.store.fetch_all(experiment, Some(&plan.sources())).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    experiment_id = %experiment_id,
                    error = %e,
                    "Suggestion cache unreadable; drawing fresh"
                );
                return Ok(None);
            }
        };

        for record in records {
            let candidate = record.suggestion;
            if self
                .repository
                .processed_find_by_uuid(experiment_id, candidate.uuid)
                .await?
                .is_some()
            {
                // Served by an earlier request whose eviction was skipped.
                if let Cleanup::Skipped(e) = self.store.remove(&candidate).await {
                    tracing::debug!(uuid = %candidate.uuid, error = %e, "Served suggestion left in cache");
                }
                continue;
            }
            if self
                .resolver
                .should_ignore(experiment, &candidate, snapshot)
                .await?
            {
                continue;
            }
            return Ok(Some(candidate));
        }
        Ok(None)
    }

    /// Draw one candidate from the plan, redrawing repeats. When every
    /// redraw repeats, fall back to a conflict-replacement random draw.
    async fn draw_fresh(
        &self,
        experiment: &Experiment,
        snapshot: &OptimizationSnapshot,
        plan: &SelectionPlan,
    ) -> SuggestResult<UnprocessedSuggestion> {
        for attempt in 0..=self.config.max_repeat_redraws {
            let drawn = self.samplers.draw(experiment, snapshot, plan).await?;
            // `draw` rejects empty phases, so there is at least one.
            let Some(candidate) = drawn.into_iter().next() else {
                continue;
            };
            if !self
                .resolver
                .should_ignore(experiment, &candidate, snapshot)
                .await?
            {
                return Ok(candidate);
            }
            tracing::debug!(attempt, uuid = %candidate.uuid, "Redrawing repeated candidate");
        }

        tracing::warn!(
            experiment_id = %experiment.experiment_id,
            redraws = self.config.max_repeat_redraws,
            "Every draw repeated; falling back to conflict replacement"
        );
        let assignments = self.resolver.draw_replacement(experiment).await?;
        Ok(UnprocessedSuggestion::new(
            experiment.experiment_id,
            Source::ConflictReplacement,
            assignments,
        ))
    }

    /// Fill the cache with one generation of candidates.
    ///
    /// Draws `default_generation_size` candidates following the selector's
    /// plan and stores them. A store failure is returned to the caller.
    pub async fn replenish(
        &self,
        experiment: &Experiment,
        snapshot: &OptimizationSnapshot,
    ) -> SuggestResult<Stored> {
        let plan = self
            .selector
            .select(experiment, snapshot, self.config.default_generation_size)?;
        let batch = self.samplers.draw(experiment, snapshot, &plan).await?;
        let stored = self
            .store
            .store(experiment.experiment_id, &batch, None)
            .await?;
        tracing::info!(
            experiment_id = %experiment.experiment_id,
            plan = %plan,
            count = stored.count,
            "Replenished suggestion cache"
        );
        Ok(stored)
    }

    /// Current optimization state of an experiment.
    pub async fn load_snapshot(&self, experiment: &Experiment) -> SuggestResult<OptimizationSnapshot> {
        let experiment_id = experiment.experiment_id;
        let observation_count = self.repository.observation_count(experiment_id).await?;
        let latest_observation = self.repository.observation_latest(experiment_id).await?;
        let open_suggestions = self.repository.processed_list_open(experiment_id).await?;
        Ok(OptimizationSnapshot {
            observation_count,
            latest_observation,
            open_suggestions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::FixedStencil;
    use suggestion_core::{Assignments, QueuedSuggestion, SamplerKind};
    use suggestion_storage::{InMemoryCacheBackend, InMemorySuggestionRepository};
    use suggestion_test_utils::{fixtures, ScriptedSampler};

    type TestBroker = SuggestionBroker<InMemoryCacheBackend, InMemorySuggestionRepository>;

    fn broker(samplers: SamplerTable, config: BrokerConfig) -> TestBroker {
        let store = Arc::new(SuggestionStore::new(
            Arc::new(InMemoryCacheBackend::default()),
            fixtures::fast_cache_config(),
            &config,
        ));
        SuggestionBroker::new(
            store,
            Arc::new(InMemorySuggestionRepository::new()),
            samplers,
            Arc::new(FixedStencil(0)),
            config,
        )
        .unwrap()
        .with_replacement_sampler(Arc::new(RandomSampler::seeded(9)))
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = BrokerConfig::default().with_backlog_multiplier(0);
        let store = Arc::new(SuggestionStore::new(
            Arc::new(InMemoryCacheBackend::default()),
            fixtures::fast_cache_config(),
            &BrokerConfig::default(),
        ));
        let result = SuggestionBroker::new(
            store,
            Arc::new(InMemorySuggestionRepository::new()),
            SamplerTable::new(),
            Arc::new(FixedStencil(0)),
            config,
        );
        assert!(matches!(result, Err(SuggestError::Config(_))));
    }

    #[tokio::test]
    async fn test_queued_entry_is_served_and_deleted() {
        let b = broker(SamplerTable::random_stand_ins(1), BrokerConfig::default());
        let experiment = fixtures::single_int_experiment();
        let queued = QueuedSuggestion::new(experiment.experiment_id, Assignments::new().with("a", 42i64));
        b.repository().queued_insert(&queued).await.unwrap();

        let served = b.serve_suggestion(&experiment, &RequestMeta::new()).await.unwrap();
        assert_eq!(served.source, Source::Queued);
        assert_eq!(served.queued_id, Some(queued.queued_id));
        assert_eq!(b.repository().queued_count().await, 0);
    }

    #[tokio::test]
    async fn test_cached_candidate_is_preferred_and_evicted() {
        let b = broker(SamplerTable::random_stand_ins(2), BrokerConfig::default());
        let experiment = fixtures::random_experiment();
        let snapshot = b.load_snapshot(&experiment).await.unwrap();
        b.replenish(&experiment, &snapshot).await.unwrap();
        assert_eq!(
            b.store()
                .bucket_len(experiment.experiment_id, Source::Random)
                .await
                .unwrap(),
            5
        );

        let served = b.serve_suggestion(&experiment, &RequestMeta::new()).await.unwrap();
        assert_eq!(served.source, Source::Random);
        assert_eq!(
            b.store()
                .bucket_len(experiment.experiment_id, Source::Random)
                .await
                .unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_repeated_draw_is_redrawn() {
        let experiment = fixtures::single_int_experiment();
        let scripted = Arc::new(ScriptedSampler::new(
            SamplerKind::QueueReranking,
            [1i64, 1, 2].map(|a| Assignments::new().with("a", a)),
        ));
        let b = broker(
            SamplerTable::new().with_sampler(scripted.clone()),
            BrokerConfig::default(),
        );

        let first = b.serve_suggestion(&experiment, &RequestMeta::new()).await.unwrap();
        let second = b.serve_suggestion(&experiment, &RequestMeta::new()).await.unwrap();
        assert!(first.assignments.is_identical(&Assignments::new().with("a", 1i64)));
        assert!(second.assignments.is_identical(&Assignments::new().with("a", 2i64)));
        assert_eq!(scripted.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_redraws_fall_back_to_replacement() {
        let experiment = fixtures::single_int_experiment();
        let b = broker(
            SamplerTable::new().with_sampler(Arc::new(suggestion_test_utils::FixedSampler::new(
                SamplerKind::QueueReranking,
                Assignments::new().with("a", 1i64),
            ))),
            BrokerConfig::default().with_max_repeat_redraws(2),
        );

        b.serve_suggestion(&experiment, &RequestMeta::new()).await.unwrap();
        let second = b.serve_suggestion(&experiment, &RequestMeta::new()).await.unwrap();
        assert_eq!(second.source, Source::ConflictReplacement);
        assert!(!second.assignments.is_identical(&Assignments::new().with("a", 1i64)));
    }

    #[tokio::test]
    async fn test_load_snapshot_reflects_repository() {
        let b = broker(SamplerTable::random_stand_ins(3), BrokerConfig::default());
        let experiment = fixtures::single_int_experiment();
        let served = b.serve_suggestion(&experiment, &RequestMeta::new()).await.unwrap();

        let snapshot = b.load_snapshot(&experiment).await.unwrap();
        assert_eq!(snapshot.observation_count, 0);
        assert_eq!(snapshot.open_suggestions.len(), 1);
        assert_eq!(snapshot.open_suggestions[0].processed_id, served.processed_id);

        b.repository()
            .observation_insert(
                &suggestion_core::Observation::new(experiment.experiment_id, served.assignments.clone())
                    .for_suggestion(served.processed_id),
            )
            .await
            .unwrap();
        let snapshot = b.load_snapshot(&experiment).await.unwrap();
        assert_eq!(snapshot.observation_count, 1);
        assert!(snapshot.open_suggestions.is_empty());
        assert!(snapshot.latest_observation.is_some());
    }
}
