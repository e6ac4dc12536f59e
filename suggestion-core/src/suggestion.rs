//! Suggestion lifecycle entities
//!
//! A candidate is born as an [`UnprocessedSuggestion`] (from a sampler or a
//! [`QueuedSuggestion`]), sits in the cache, and becomes a
//! [`ProcessedSuggestion`] once a serve event claims it.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    Assignments, EntityIdType, ExperimentId, ObservationId, ProcessedSuggestionId,
    QueuedSuggestionId, RequestId, Source, SuggestionId, Timestamp,
};

/// A generated, not-yet-served candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnprocessedSuggestion {
    pub uuid: SuggestionId,
    pub experiment_id: ExperimentId,
    pub source: Source,
    pub generated_at: Timestamp,
    pub assignments: Assignments,
    /// Set when the candidate was converted from a queued entry.
    #[serde(default)]
    pub queued_id: Option<QueuedSuggestionId>,
}

impl UnprocessedSuggestion {
    pub fn new(experiment_id: ExperimentId, source: Source, assignments: Assignments) -> Self {
        Self {
            uuid: SuggestionId::now_v7(),
            experiment_id,
            source,
            generated_at: Utc::now(),
            assignments,
            queued_id: None,
        }
    }

    /// Convert a queued entry. The uuid is derived from the queued id, so
    /// every conversion of the same entry yields the same uuid.
    pub fn from_queued(queued: &QueuedSuggestion) -> Self {
        Self {
            uuid: SuggestionId::for_queued(queued.queued_id),
            experiment_id: queued.experiment_id,
            source: Source::Queued,
            generated_at: Utc::now(),
            assignments: queued.assignments.clone(),
            queued_id: Some(queued.queued_id),
        }
    }

    pub fn with_generated_at(mut self, generated_at: Timestamp) -> Self {
        self.generated_at = generated_at;
        self
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    pub fn is_queue_derived(&self) -> bool {
        self.queued_id.is_some()
    }
}

/// The durable link between a candidate and the serve event that returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedSuggestion {
    pub processed_id: ProcessedSuggestionId,
    /// Unique per experiment: a second insert with the same uuid fails.
    pub suggestion_uuid: SuggestionId,
    pub experiment_id: ExperimentId,
    pub source: Source,
    pub assignments: Assignments,
    #[serde(default)]
    pub queued_id: Option<QueuedSuggestionId>,
    pub request_id: RequestId,
    pub served_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
}

impl ProcessedSuggestion {
    /// Link a candidate to the request serving it.
    pub fn serve(suggestion: &UnprocessedSuggestion, meta: &RequestMeta) -> Self {
        Self {
            processed_id: ProcessedSuggestionId::now_v7(),
            suggestion_uuid: suggestion.uuid,
            experiment_id: suggestion.experiment_id,
            source: suggestion.source,
            assignments: suggestion.assignments.clone(),
            queued_id: suggestion.queued_id,
            request_id: meta.request_id,
            served_at: Utc::now(),
            deleted: false,
        }
    }
}

/// A user-submitted assignment waiting to be served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedSuggestion {
    pub queued_id: QueuedSuggestionId,
    pub experiment_id: ExperimentId,
    pub assignments: Assignments,
    pub created_at: Timestamp,
}

impl QueuedSuggestion {
    pub fn new(experiment_id: ExperimentId, assignments: Assignments) -> Self {
        Self {
            queued_id: QueuedSuggestionId::now_v7(),
            experiment_id,
            assignments,
            created_at: Utc::now(),
        }
    }
}

/// A reported evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub observation_id: ObservationId,
    pub experiment_id: ExperimentId,
    /// The served suggestion this observation reports on, if any.
    #[serde(default)]
    pub processed_id: Option<ProcessedSuggestionId>,
    pub assignments: Assignments,
    #[serde(default)]
    pub failed: bool,
    pub created_at: Timestamp,
}

impl Observation {
    pub fn new(experiment_id: ExperimentId, assignments: Assignments) -> Self {
        Self {
            observation_id: ObservationId::now_v7(),
            experiment_id,
            processed_id: None,
            assignments,
            failed: false,
            created_at: Utc::now(),
        }
    }

    pub fn for_suggestion(mut self, processed_id: ProcessedSuggestionId) -> Self {
        self.processed_id = Some(processed_id);
        self
    }
}

/// Live optimization state read once per serve call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OptimizationSnapshot {
    pub observation_count: u64,
    pub latest_observation: Option<Observation>,
    /// Served suggestions without an observation that are not deleted.
    pub open_suggestions: Vec<ProcessedSuggestion>,
}

impl OptimizationSnapshot {
    pub fn new(observation_count: u64) -> Self {
        Self {
            observation_count,
            ..Default::default()
        }
    }

    pub fn with_latest_observation(mut self, observation: Observation) -> Self {
        self.latest_observation = Some(observation);
        self
    }

    pub fn with_open_suggestions(mut self, open: Vec<ProcessedSuggestion>) -> Self {
        self.open_suggestions = open;
        self
    }

    /// Whether `assignments` repeat the latest observation or an open
    /// suggestion held in this snapshot.
    pub fn repeats(&self, assignments: &Assignments) -> bool {
        self.latest_observation
            .as_ref()
            .is_some_and(|o| o.assignments.is_identical(assignments))
            || self
                .open_suggestions
                .iter()
                .any(|s| s.assignments.is_identical(assignments))
    }
}

/// Per-request metadata carried into the processed link and log fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub request_id: RequestId,
    #[serde(default)]
    pub client: Option<String>,
}

impl RequestMeta {
    pub fn new() -> Self {
        Self {
            request_id: RequestId::now_v7(),
            client: None,
        }
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }
}

impl Default for RequestMeta {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_queued_is_deterministic() {
        let experiment_id = ExperimentId::now_v7();
        let queued = QueuedSuggestion::new(experiment_id, Assignments::new().with("a", 1i64));

        let first = UnprocessedSuggestion::from_queued(&queued);
        let second = UnprocessedSuggestion::from_queued(&queued);

        assert_eq!(first.uuid, second.uuid);
        assert_eq!(first.source, Source::Queued);
        assert_eq!(first.queued_id, Some(queued.queued_id));
        assert!(first.is_queue_derived());
    }

    #[test]
    fn test_serve_copies_candidate() {
        let candidate = UnprocessedSuggestion::new(
            ExperimentId::now_v7(),
            Source::Random,
            Assignments::new().with("x", 0.5),
        );
        let meta = RequestMeta::new().with_client("worker-1");
        let processed = ProcessedSuggestion::serve(&candidate, &meta);

        assert_eq!(processed.suggestion_uuid, candidate.uuid);
        assert_eq!(processed.experiment_id, candidate.experiment_id);
        assert_eq!(processed.request_id, meta.request_id);
        assert_eq!(processed.source, Source::Random);
        assert!(!processed.deleted);
    }

    #[test]
    fn test_snapshot_repeats() {
        let experiment_id = ExperimentId::now_v7();
        let open = ProcessedSuggestion::serve(
            &UnprocessedSuggestion::new(
                experiment_id,
                Source::Random,
                Assignments::new().with("a", 1i64),
            ),
            &RequestMeta::new(),
        );
        let snapshot = OptimizationSnapshot::new(1)
            .with_latest_observation(Observation::new(
                experiment_id,
                Assignments::new().with("a", 2i64),
            ))
            .with_open_suggestions(vec![open]);

        assert!(snapshot.repeats(&Assignments::new().with("a", 1i64)));
        assert!(snapshot.repeats(&Assignments::new().with("a", 2i64)));
        assert!(!snapshot.repeats(&Assignments::new().with("a", 3i64)));
        assert!(!OptimizationSnapshot::default().repeats(&Assignments::new()));
    }

    #[test]
    fn test_unprocessed_serde_roundtrip() {
        let candidate = UnprocessedSuggestion::new(
            ExperimentId::now_v7(),
            Source::LowDiscrepancy,
            Assignments::new().with("n", 4i64).with("c", "red"),
        );
        let json = serde_json::to_vec(&candidate).expect("serialize");
        let back: UnprocessedSuggestion = serde_json::from_slice(&json).expect("deserialize");
        assert_eq!(candidate, back);
    }
}
