//! Relational boundary for served suggestions, the queue, and observations.
//!
//! Writes are single-row and atomic. The unique suggestion uuid per
//! experiment is what turns a queue claim race into a detectable
//! [`RepositoryError::DuplicateSuggestion`].

use std::collections::HashMap;

use async_trait::async_trait;
use suggestion_core::{
    Assignments, EntityIdType, EntityType, ExperimentId, Observation, ProcessedSuggestion,
    ProcessedSuggestionId, QueuedSuggestion, QueuedSuggestionId, RepositoryError, Source,
    SuggestionId,
};
use tokio::sync::RwLock;

/// Async repository trait for suggestion persistence.
#[async_trait]
pub trait SuggestionRepository: Send + Sync {
    // ========================================================================
    // PROCESSED SUGGESTION OPERATIONS
    // ========================================================================

    /// Insert a served link. Fails with `DuplicateSuggestion` if the
    /// experiment already has a link for the same suggestion uuid.
    async fn processed_insert(&self, processed: &ProcessedSuggestion) -> Result<(), RepositoryError>;

    /// Get a served link by id.
    async fn processed_get(
        &self,
        id: ProcessedSuggestionId,
    ) -> Result<ProcessedSuggestion, RepositoryError>;

    /// Find the link for a suggestion uuid, if it was served.
    async fn processed_find_by_uuid(
        &self,
        experiment_id: ExperimentId,
        uuid: SuggestionId,
    ) -> Result<Option<ProcessedSuggestion>, RepositoryError>;

    /// Oldest open (not deleted, not yet observed) link with identical
    /// assignments, skipping `exclude`.
    async fn processed_find_matching_open(
        &self,
        experiment_id: ExperimentId,
        assignments: &Assignments,
        exclude: Option<ProcessedSuggestionId>,
    ) -> Result<Option<ProcessedSuggestion>, RepositoryError>;

    /// Oldest non-deleted link with identical assignments, open or observed,
    /// skipping `exclude`.
    async fn processed_find_matching(
        &self,
        experiment_id: ExperimentId,
        assignments: &Assignments,
        exclude: Option<ProcessedSuggestionId>,
    ) -> Result<Option<ProcessedSuggestion>, RepositoryError>;

    /// Atomically swap `id`'s assignments for `replacement`, tagged as a
    /// conflict replacement, but only while another non-deleted link of the
    /// experiment still holds the same assignments as `id`. Returns `None`
    /// when no collision is left.
    async fn processed_replace_if_colliding(
        &self,
        id: ProcessedSuggestionId,
        replacement: &Assignments,
    ) -> Result<Option<ProcessedSuggestion>, RepositoryError>;

    /// Mark a link deleted.
    async fn processed_delete(&self, id: ProcessedSuggestionId) -> Result<(), RepositoryError>;

    /// All open links of an experiment, oldest first.
    async fn processed_list_open(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<Vec<ProcessedSuggestion>, RepositoryError>;

    // ========================================================================
    // QUEUE OPERATIONS
    // ========================================================================

    /// Add a user-submitted suggestion to the queue.
    async fn queued_insert(&self, queued: &QueuedSuggestion) -> Result<(), RepositoryError>;

    /// Oldest queued entry not in `exclude`.
    async fn queued_next(
        &self,
        experiment_id: ExperimentId,
        exclude: &[QueuedSuggestionId],
    ) -> Result<Option<QueuedSuggestion>, RepositoryError>;

    /// Remove a queued entry. Returns whether it existed.
    async fn queued_delete(&self, id: QueuedSuggestionId) -> Result<bool, RepositoryError>;

    // ========================================================================
    // OBSERVATION OPERATIONS
    // ========================================================================

    async fn observation_insert(&self, observation: &Observation) -> Result<(), RepositoryError>;

    async fn observation_count(&self, experiment_id: ExperimentId) -> Result<u64, RepositoryError>;

    async fn observation_latest(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<Option<Observation>, RepositoryError>;

    /// Any observation of the experiment with identical assignments.
    async fn observation_find_matching(
        &self,
        experiment_id: ExperimentId,
        assignments: &Assignments,
    ) -> Result<Option<Observation>, RepositoryError>;
}

// ============================================================================
// IN-MEMORY REPOSITORY
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    processed: HashMap<ProcessedSuggestionId, ProcessedSuggestion>,
    queued: HashMap<QueuedSuggestionId, QueuedSuggestion>,
    observations: Vec<Observation>,
}

impl Tables {
    fn is_observed(&self, id: ProcessedSuggestionId) -> bool {
        self.observations.iter().any(|o| o.processed_id == Some(id))
    }

    fn is_open(&self, processed: &ProcessedSuggestion) -> bool {
        !processed.deleted && !self.is_observed(processed.processed_id)
    }

    fn oldest_matching<'a>(
        &'a self,
        experiment_id: ExperimentId,
        assignments: &Assignments,
        exclude: Option<ProcessedSuggestionId>,
        open_only: bool,
    ) -> Option<&'a ProcessedSuggestion> {
        self.processed
            .values()
            .filter(|p| p.experiment_id == experiment_id && !p.deleted)
            .filter(|p| Some(p.processed_id) != exclude)
            .filter(|p| !open_only || self.is_open(p))
            .filter(|p| p.assignments.is_identical(assignments))
            .min_by_key(|p| p.processed_id)
    }
}

/// In-memory repository for tests and local runs.
///
/// Uses tokio::sync::RwLock for safe async access.
#[derive(Debug, Default)]
pub struct InMemorySuggestionRepository {
    tables: RwLock<Tables>,
}

impl InMemorySuggestionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of served links, deleted ones included.
    pub async fn processed_count(&self) -> usize {
        self.tables.read().await.processed.len()
    }

    /// All served links of an experiment, oldest first.
    pub async fn processed_list(&self, experiment_id: ExperimentId) -> Vec<ProcessedSuggestion> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ProcessedSuggestion> = tables
            .processed
            .values()
            .filter(|p| p.experiment_id == experiment_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.processed_id);
        rows
    }

    pub async fn queued_count(&self) -> usize {
        self.tables.read().await.queued.len()
    }
}

#[async_trait]
impl SuggestionRepository for InMemorySuggestionRepository {
    async fn processed_insert(&self, processed: &ProcessedSuggestion) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.processed.values().any(|p| {
            p.experiment_id == processed.experiment_id
                && p.suggestion_uuid == processed.suggestion_uuid
        }) {
            return Err(RepositoryError::DuplicateSuggestion {
                uuid: processed.suggestion_uuid,
            });
        }
        if tables.processed.contains_key(&processed.processed_id) {
            return Err(RepositoryError::InsertFailed {
                entity_type: EntityType::ProcessedSuggestion,
                reason: "already exists".to_string(),
            });
        }
        tables
            .processed
            .insert(processed.processed_id, processed.clone());
        Ok(())
    }

    async fn processed_get(
        &self,
        id: ProcessedSuggestionId,
    ) -> Result<ProcessedSuggestion, RepositoryError> {
        let tables = self.tables.read().await;
        tables
            .processed
            .get(&id)
            .cloned()
            .ok_or(RepositoryError::NotFound {
                entity_type: EntityType::ProcessedSuggestion,
                id: id.as_uuid(),
            })
    }

    async fn processed_find_by_uuid(
        &self,
        experiment_id: ExperimentId,
        uuid: SuggestionId,
    ) -> Result<Option<ProcessedSuggestion>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .processed
            .values()
            .find(|p| p.experiment_id == experiment_id && p.suggestion_uuid == uuid)
            .cloned())
    }

    async fn processed_find_matching_open(
        &self,
        experiment_id: ExperimentId,
        assignments: &Assignments,
        exclude: Option<ProcessedSuggestionId>,
    ) -> Result<Option<ProcessedSuggestion>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .oldest_matching(experiment_id, assignments, exclude, true)
            .cloned())
    }

    async fn processed_find_matching(
        &self,
        experiment_id: ExperimentId,
        assignments: &Assignments,
        exclude: Option<ProcessedSuggestionId>,
    ) -> Result<Option<ProcessedSuggestion>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .oldest_matching(experiment_id, assignments, exclude, false)
            .cloned())
    }

    async fn processed_replace_if_colliding(
        &self,
        id: ProcessedSuggestionId,
        replacement: &Assignments,
    ) -> Result<Option<ProcessedSuggestion>, RepositoryError> {
        let mut tables = self.tables.write().await;
        let own = tables
            .processed
            .get(&id)
            .ok_or(RepositoryError::NotFound {
                entity_type: EntityType::ProcessedSuggestion,
                id: id.as_uuid(),
            })?;
        if tables
            .oldest_matching(own.experiment_id, &own.assignments, Some(id), false)
            .is_none()
        {
            return Ok(None);
        }

        let Some(own) = tables.processed.get_mut(&id) else {
            return Ok(None);
        };
        own.assignments = replacement.clone();
        own.source = Source::ConflictReplacement;
        Ok(Some(own.clone()))
    }

    async fn processed_delete(&self, id: ProcessedSuggestionId) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let processed = tables
            .processed
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound {
                entity_type: EntityType::ProcessedSuggestion,
                id: id.as_uuid(),
            })?;
        processed.deleted = true;
        Ok(())
    }

    async fn processed_list_open(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<Vec<ProcessedSuggestion>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut open: Vec<ProcessedSuggestion> = tables
            .processed
            .values()
            .filter(|p| p.experiment_id == experiment_id && tables.is_open(p))
            .cloned()
            .collect();
        open.sort_by_key(|p| p.processed_id);
        Ok(open)
    }

    async fn queued_insert(&self, queued: &QueuedSuggestion) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.queued.contains_key(&queued.queued_id) {
            return Err(RepositoryError::InsertFailed {
                entity_type: EntityType::QueuedSuggestion,
                reason: "already exists".to_string(),
            });
        }
        tables.queued.insert(queued.queued_id, queued.clone());
        Ok(())
    }

    async fn queued_next(
        &self,
        experiment_id: ExperimentId,
        exclude: &[QueuedSuggestionId],
    ) -> Result<Option<QueuedSuggestion>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .queued
            .values()
            .filter(|q| q.experiment_id == experiment_id && !exclude.contains(&q.queued_id))
            .min_by_key(|q| (q.created_at, q.queued_id))
            .cloned())
    }

    async fn queued_delete(&self, id: QueuedSuggestionId) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        Ok(tables.queued.remove(&id).is_some())
    }

    async fn observation_insert(&self, observation: &Observation) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables
            .observations
            .iter()
            .any(|o| o.observation_id == observation.observation_id)
        {
            return Err(RepositoryError::InsertFailed {
                entity_type: EntityType::Observation,
                reason: "already exists".to_string(),
            });
        }
        tables.observations.push(observation.clone());
        Ok(())
    }

    async fn observation_count(&self, experiment_id: ExperimentId) -> Result<u64, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .observations
            .iter()
            .filter(|o| o.experiment_id == experiment_id)
            .count() as u64)
    }

    async fn observation_latest(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<Option<Observation>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .observations
            .iter()
            .filter(|o| o.experiment_id == experiment_id)
            .max_by_key(|o| (o.created_at, o.observation_id))
            .cloned())
    }

    async fn observation_find_matching(
        &self,
        experiment_id: ExperimentId,
        assignments: &Assignments,
    ) -> Result<Option<Observation>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .observations
            .iter()
            .find(|o| o.experiment_id == experiment_id && o.assignments.is_identical(assignments))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suggestion_core::{RequestMeta, UnprocessedSuggestion};

    fn serve(experiment_id: ExperimentId, assignments: Assignments) -> ProcessedSuggestion {
        ProcessedSuggestion::serve(
            &UnprocessedSuggestion::new(experiment_id, Source::Random, assignments),
            &RequestMeta::new(),
        )
    }

    #[tokio::test]
    async fn test_duplicate_uuid_is_rejected() {
        let repo = InMemorySuggestionRepository::new();
        let experiment_id = ExperimentId::now_v7();
        let queued = QueuedSuggestion::new(experiment_id, Assignments::new().with("a", 1i64));
        let candidate = UnprocessedSuggestion::from_queued(&queued);

        let first = ProcessedSuggestion::serve(&candidate, &RequestMeta::new());
        let second = ProcessedSuggestion::serve(&candidate, &RequestMeta::new());
        repo.processed_insert(&first).await.unwrap();

        let err = repo.processed_insert(&second).await.unwrap_err();
        assert_eq!(
            err,
            RepositoryError::DuplicateSuggestion {
                uuid: candidate.uuid
            }
        );
        assert_eq!(repo.processed_count().await, 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let repo = InMemorySuggestionRepository::new();
        let err = repo
            .processed_get(ProcessedSuggestionId::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_open_excludes_observed_and_deleted() {
        let repo = InMemorySuggestionRepository::new();
        let experiment_id = ExperimentId::now_v7();
        let a = serve(experiment_id, Assignments::new().with("a", 1i64));
        let b = serve(experiment_id, Assignments::new().with("a", 2i64));
        let c = serve(experiment_id, Assignments::new().with("a", 3i64));
        for p in [&a, &b, &c] {
            repo.processed_insert(p).await.unwrap();
        }

        repo.observation_insert(
            &Observation::new(experiment_id, b.assignments.clone()).for_suggestion(b.processed_id),
        )
        .await
        .unwrap();
        repo.processed_delete(c.processed_id).await.unwrap();

        let open = repo.processed_list_open(experiment_id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].processed_id, a.processed_id);

        assert!(repo
            .processed_find_matching_open(experiment_id, &b.assignments, None)
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .processed_find_matching(experiment_id, &b.assignments, None)
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .processed_find_matching(experiment_id, &c.assignments, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_matching_respects_exclude() {
        let repo = InMemorySuggestionRepository::new();
        let experiment_id = ExperimentId::now_v7();
        let a = serve(experiment_id, Assignments::new().with("a", 1i64));
        repo.processed_insert(&a).await.unwrap();

        assert!(repo
            .processed_find_matching(experiment_id, &a.assignments, Some(a.processed_id))
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .processed_find_matching(ExperimentId::now_v7(), &a.assignments, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_replace_if_colliding_only_once() {
        let repo = InMemorySuggestionRepository::new();
        let experiment_id = ExperimentId::now_v7();
        let a = serve(experiment_id, Assignments::new().with("a", 1i64));
        let b = serve(experiment_id, Assignments::new().with("a", 1i64));
        repo.processed_insert(&a).await.unwrap();
        repo.processed_insert(&b).await.unwrap();

        let fresh = Assignments::new().with("a", 7i64);
        let replaced = repo
            .processed_replace_if_colliding(b.processed_id, &fresh)
            .await
            .unwrap()
            .expect("collision present");
        assert_eq!(replaced.source, Source::ConflictReplacement);
        assert!(replaced.assignments.is_identical(&fresh));

        // The other side sees the collision is gone.
        let second = repo
            .processed_replace_if_colliding(a.processed_id, &Assignments::new().with("a", 8i64))
            .await
            .unwrap();
        assert!(second.is_none());
        let a_now = repo.processed_get(a.processed_id).await.unwrap();
        assert!(a_now.assignments.is_identical(&a.assignments));
        assert_eq!(a_now.source, Source::Random);
    }

    #[tokio::test]
    async fn test_replace_if_colliding_three_way() {
        let repo = InMemorySuggestionRepository::new();
        let experiment_id = ExperimentId::now_v7();
        let rows: Vec<ProcessedSuggestion> = (0..3)
            .map(|_| serve(experiment_id, Assignments::new().with("a", 1i64)))
            .collect();
        for row in &rows {
            repo.processed_insert(row).await.unwrap();
        }

        for (i, row) in rows.iter().enumerate() {
            let fresh = Assignments::new().with("a", 10 + i as i64);
            repo.processed_replace_if_colliding(row.processed_id, &fresh)
                .await
                .unwrap();
        }

        let original = Assignments::new().with("a", 1i64);
        let remaining = repo
            .processed_list(experiment_id)
            .await
            .into_iter()
            .filter(|p| p.assignments.is_identical(&original))
            .count();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn test_replace_missing_is_not_found() {
        let repo = InMemorySuggestionRepository::new();
        let err = repo
            .processed_replace_if_colliding(ProcessedSuggestionId::now_v7(), &Assignments::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_queue_order_and_exclude() {
        let repo = InMemorySuggestionRepository::new();
        let experiment_id = ExperimentId::now_v7();
        let first = QueuedSuggestion::new(experiment_id, Assignments::new().with("a", 1i64));
        let mut second = QueuedSuggestion::new(experiment_id, Assignments::new().with("a", 2i64));
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        repo.queued_insert(&second).await.unwrap();
        repo.queued_insert(&first).await.unwrap();

        let next = repo.queued_next(experiment_id, &[]).await.unwrap();
        assert_eq!(next.map(|q| q.queued_id), Some(first.queued_id));

        let next = repo
            .queued_next(experiment_id, &[first.queued_id])
            .await
            .unwrap();
        assert_eq!(next.map(|q| q.queued_id), Some(second.queued_id));

        assert!(repo.queued_delete(first.queued_id).await.unwrap());
        assert!(!repo.queued_delete(first.queued_id).await.unwrap());
        assert_eq!(repo.queued_count().await, 1);
    }

    #[tokio::test]
    async fn test_observation_latest_and_count() {
        let repo = InMemorySuggestionRepository::new();
        let experiment_id = ExperimentId::now_v7();
        let older = Observation::new(experiment_id, Assignments::new().with("a", 1i64));
        let mut newer = Observation::new(experiment_id, Assignments::new().with("a", 2i64));
        newer.created_at = older.created_at + chrono::Duration::seconds(1);
        repo.observation_insert(&newer).await.unwrap();
        repo.observation_insert(&older).await.unwrap();

        assert_eq!(repo.observation_count(experiment_id).await.unwrap(), 2);
        assert_eq!(
            repo.observation_latest(experiment_id)
                .await
                .unwrap()
                .map(|o| o.observation_id),
            Some(newer.observation_id)
        );
        assert!(repo
            .observation_find_matching(experiment_id, &Assignments::new().with("a", 1i64))
            .await
            .unwrap()
            .is_some());
        assert_eq!(repo.observation_count(ExperimentId::now_v7()).await.unwrap(), 0);
    }
}
