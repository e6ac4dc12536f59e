//! Duplicate detection and repair.
//!
//! Two checks can flag a candidate before it is served:
//! - the in-memory check compares against the snapshot (latest observation
//!   and open suggestions)
//! - the durable check queries the repository for an open suggestion or an
//!   observation with the same assignments
//!
//! Both are skipped for grid and development experiments. After a link is
//! persisted, [`ConflictResolver::replace_with_random_if_necessary`] repairs
//! collisions that slipped past both checks under concurrency.

use std::sync::Arc;

use suggestion_core::{
    Assignments, BrokerConfig, Experiment, OptimizationSnapshot, ProcessedSuggestion,
    SuggestResult, UnprocessedSuggestion,
};
use suggestion_storage::SuggestionRepository;

use crate::random::RandomSampler;

pub struct ConflictResolver<R: SuggestionRepository> {
    repository: Arc<R>,
    random: Arc<RandomSampler>,
    check_snapshot: bool,
    check_repository: bool,
    max_replacement_draws: u32,
}

impl<R: SuggestionRepository> ConflictResolver<R> {
    pub fn new(repository: Arc<R>, random: Arc<RandomSampler>, config: &BrokerConfig) -> Self {
        Self {
            repository,
            random,
            check_snapshot: config.ignore_repeated_suggestions,
            check_repository: config.alternate_ignore_repeated_suggestions,
            max_replacement_draws: config.max_replacement_draws,
        }
    }

    /// Whether `candidate` repeats something already served or observed.
    pub async fn should_ignore(
        &self,
        experiment: &Experiment,
        candidate: &UnprocessedSuggestion,
        snapshot: &OptimizationSnapshot,
    ) -> SuggestResult<bool> {
        if !experiment.permits_conflict_replacement() {
            return Ok(false);
        }
        let assignments = &candidate.assignments;

        if self.check_snapshot && snapshot.repeats(assignments) {
            tracing::debug!(
                experiment_id = %experiment.experiment_id,
                uuid = %candidate.uuid,
                "Candidate repeats the snapshot"
            );
            return Ok(true);
        }

        if self.check_repository {
            let experiment_id = experiment.experiment_id;
            let open = self
                .repository
                .processed_find_matching_open(experiment_id, assignments, None)
                .await?;
            let repeated = open.is_some()
                || self
                    .repository
                    .observation_find_matching(experiment_id, assignments)
                    .await?
                    .is_some();
            if repeated {
                tracing::debug!(
                    experiment_id = %experiment_id,
                    uuid = %candidate.uuid,
                    "Candidate repeats a stored suggestion or observation"
                );
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Repair a collision between `processed` and another served suggestion.
    ///
    /// If another non-deleted link holds the same assignments, `processed`
    /// is swapped for a fresh random vector tagged as a conflict
    /// replacement. The swap is conditional on a collision still existing,
    /// so of any group of colliding requests exactly one keeps the vector.
    /// Returns the link as it now stands.
    pub async fn replace_with_random_if_necessary(
        &self,
        experiment: &Experiment,
        processed: &ProcessedSuggestion,
    ) -> SuggestResult<ProcessedSuggestion> {
        if !experiment.permits_conflict_replacement() {
            return Ok(processed.clone());
        }
        let experiment_id = experiment.experiment_id;

        let Some(other) = self
            .repository
            .processed_find_matching(
                experiment_id,
                &processed.assignments,
                Some(processed.processed_id),
            )
            .await?
        else {
            return Ok(processed.clone());
        };

        let replacement = self.draw_replacement(experiment).await?;
        match self
            .repository
            .processed_replace_if_colliding(processed.processed_id, &replacement)
            .await?
        {
            Some(replaced) => {
                tracing::info!(
                    experiment_id = %experiment_id,
                    processed_id = %processed.processed_id,
                    colliding_with = %other.processed_id,
                    "Replaced colliding suggestion with a random draw"
                );
                Ok(replaced)
            }
            None => {
                tracing::debug!(
                    experiment_id = %experiment_id,
                    processed_id = %processed.processed_id,
                    "Collision already repaired by the other request"
                );
                Ok(self.repository.processed_get(processed.processed_id).await?)
            }
        }
    }

    /// A random assignment vector that matches no served suggestion or
    /// observation, if one turns up within the draw budget. Otherwise the
    /// last draw.
    pub async fn draw_replacement(&self, experiment: &Experiment) -> SuggestResult<Assignments> {
        let experiment_id = experiment.experiment_id;
        let mut last = None;
        for _ in 0..self.max_replacement_draws.max(1) {
            let assignments = self.random.draw_assignments(experiment)?;
            let taken = self
                .repository
                .processed_find_matching(experiment_id, &assignments, None)
                .await?
                .is_some()
                || self
                    .repository
                    .observation_find_matching(experiment_id, &assignments)
                    .await?
                    .is_some();
            if !taken {
                return Ok(assignments);
            }
            last = Some(assignments);
        }

        tracing::warn!(
            experiment_id = %experiment_id,
            draws = self.max_replacement_draws,
            "Every replacement draw collided; using the last one"
        );
        match last {
            Some(assignments) => Ok(assignments),
            None => Ok(self.random.draw_assignments(experiment)?),
        }
    }
}
