//! Error types for suggestion operations

use crate::{EntityType, ExperimentId, SamplerKind, Source, SuggestionId};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Suggestion cache errors.
///
/// These are transient from the caller's point of view: the cache policy
/// retries the ones `is_transient` accepts and surfaces the rest.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Cache operation {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Cache connection failed: {reason}")]
    Connection { reason: String },

    #[error("Cache payload could not be (de)serialized: {reason}")]
    Serialization { reason: String },

    #[error("Cache write to {key} failed: {reason}")]
    WriteFailed { key: String, reason: String },
}

impl StoreError {
    /// Whether retrying the same operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout { .. } | StoreError::Connection { .. }
        )
    }
}

/// Best-effort cache hygiene failure.
///
/// Never part of [`SuggestError`]: the processed-suggestion link is already
/// authoritative when these occur.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SoftCacheError {
    #[error("Could not remove cached suggestion {uuid}: {reason}")]
    RemoveFailed { uuid: SuggestionId, reason: String },

    #[error("Could not truncate {bucket} backlog: {reason}")]
    TruncateFailed { bucket: Source, reason: String },

    #[error("Could not invalidate experiment {experiment_id}: {reason}")]
    InvalidateFailed {
        experiment_id: ExperimentId,
        reason: String,
    },
}

/// Relational store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Entity not found: {entity_type:?} with id {id}")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("Suggestion {uuid} has already been processed")]
    DuplicateSuggestion { uuid: SuggestionId },

    #[error("Insert failed for {entity_type:?}: {reason}")]
    InsertFailed {
        entity_type: EntityType,
        reason: String,
    },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },
}

/// Proposal strategy errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SamplerError {
    #[error("No sampler registered for {kind}")]
    NotRegistered { kind: SamplerKind },

    #[error("No strategy applies to this experiment state")]
    NoStrategy,

    #[error("Sampler {kind} returned no candidates")]
    EmptyDraw { kind: SamplerKind },

    #[error("Sampler {kind} produced an invalid candidate: {reason}")]
    InvalidCandidate { kind: SamplerKind, reason: String },

    #[error("Sampler {kind} failed: {reason}")]
    Failed { kind: SamplerKind, reason: String },
}

/// Assignment validation errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Missing assignment for active parameter: {name}")]
    MissingParameter { name: String },

    #[error("Parameter {name} is assigned but its conditions are not satisfied")]
    InactiveParameter { name: String },

    #[error("Value {value} for {name} is outside [{min}, {max}]")]
    OutOfBounds {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Value {value} for {name} is not in its domain")]
    NotInDomain { name: String, value: String },

    #[error("Value for {name} has the wrong type: expected {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("Linear constraint {index} violated: {lhs} vs threshold {threshold}")]
    ConstraintViolated {
        index: usize,
        lhs: f64,
        threshold: f64,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for serving suggestions.
#[derive(Debug, Clone, Error)]
pub enum SuggestError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Could not process a suggestion for experiment {experiment_id} after {attempts} attempts")]
    CouldNotProcessSuggestion {
        experiment_id: ExperimentId,
        attempts: u32,
    },
}

impl SuggestError {
    /// Whether this is the unique-uuid violation that signals a claim race.
    pub fn is_duplicate_suggestion(&self) -> bool {
        matches!(
            self,
            SuggestError::Repository(RepositoryError::DuplicateSuggestion { .. })
        )
    }
}

/// Result type alias for suggestion operations.
pub type SuggestResult<T> = Result<T, SuggestError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityIdType;

    #[test]
    fn test_store_error_transient_classification() {
        assert!(StoreError::Timeout {
            operation: "hash_get_all",
            after: Duration::from_millis(250),
        }
        .is_transient());
        assert!(StoreError::Connection {
            reason: "reset".to_string()
        }
        .is_transient());
        assert!(!StoreError::Serialization {
            reason: "eof".to_string()
        }
        .is_transient());
        assert!(!StoreError::WriteFailed {
            key: "k".to_string(),
            reason: "oom".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_repository_error_display_not_found() {
        let err = RepositoryError::NotFound {
            entity_type: EntityType::ProcessedSuggestion,
            id: Uuid::nil(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("ProcessedSuggestion"));
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_sampler_error_display() {
        let err = SamplerError::Failed {
            kind: SamplerKind::LowDiscrepancy,
            reason: "stencil exhausted".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("low_discrepancy"));
        assert!(msg.contains("stencil exhausted"));
    }

    #[test]
    fn test_could_not_process_display() {
        let err = SuggestError::CouldNotProcessSuggestion {
            experiment_id: ExperimentId::nil(),
            attempts: 3,
        };
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn test_suggest_error_from_variants() {
        let store = SuggestError::from(StoreError::Connection {
            reason: "down".to_string(),
        });
        assert!(matches!(store, SuggestError::Store(_)));

        let repo = SuggestError::from(RepositoryError::DuplicateSuggestion {
            uuid: SuggestionId::nil(),
        });
        assert!(repo.is_duplicate_suggestion());

        let sampler = SuggestError::from(SamplerError::NoStrategy);
        assert!(matches!(sampler, SuggestError::Sampler(_)));
        assert!(!sampler.is_duplicate_suggestion());

        let validation = SuggestError::from(ValidationError::UnknownParameter {
            name: "z".to_string(),
        });
        assert!(matches!(validation, SuggestError::Validation(_)));

        let config = SuggestError::from(ConfigError::InvalidValue {
            field: "backlog_multiplier".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        });
        assert!(matches!(config, SuggestError::Config(_)));
    }

    #[test]
    fn test_soft_cache_error_display() {
        let err = SoftCacheError::TruncateFailed {
            bucket: Source::Random,
            reason: "timeout".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("random"));
        assert!(msg.contains("timeout"));
    }
}
