//! Suggestion Core - Entity Types
//!
//! Pure data structures shared by the storage and broker crates. No I/O.

mod assignments;
mod config;
mod enums;
mod error;
mod experiment;
mod identity;
mod sampler;
mod suggestion;

pub use assignments::{AssignmentValue, Assignments};
pub use config::{BrokerConfig, RetryConfig};
pub use enums::{
    ConstraintKind, EntityType, ExperimentType, MetricStrategy, SamplerKind, Source,
    SourceParseError,
};
pub use error::{
    ConfigError, RepositoryError, SamplerError, SoftCacheError, StoreError, SuggestError,
    SuggestResult, ValidationError,
};
pub use experiment::{
    Conditional, Experiment, LinearConstraint, Metric, Parameter, ParameterKind, Prior, Task,
};
pub use identity::{
    ContentHash, EntityIdType, ExperimentId, ObservationId,
    ProcessedSuggestionId, QueuedSuggestionId, RequestId, SuggestionId, Timestamp,
    QUEUED_SUGGESTION_NAMESPACE,
};
pub use sampler::ProposalSampler;
pub use suggestion::{
    Observation, OptimizationSnapshot, ProcessedSuggestion, QueuedSuggestion, RequestMeta,
    UnprocessedSuggestion,
};
