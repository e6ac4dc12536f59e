//! Suggestion Broker Test Utilities
//!
//! Centralized test infrastructure for the workspace:
//! - Proptest generators for ids, sources and assignment vectors
//! - Fake samplers with scripted, fixed, or failing output
//! - Experiment fixtures for the selector and broker scenarios
//! - Assertions for broker-specific error shapes

// Re-export in-memory backends from their source crate
pub use suggestion_storage::{InMemoryCacheBackend, InMemorySuggestionRepository};

// Re-export core types for convenience
pub use suggestion_core::{
    AssignmentValue, Assignments, BrokerConfig, ConstraintKind, EntityIdType, EntityType,
    Experiment, ExperimentId, ExperimentType, LinearConstraint, MetricStrategy,
    OptimizationSnapshot, Parameter, Prior, ProposalSampler, RepositoryError, RetryConfig,
    SamplerError, SamplerKind, Source, SuggestError, SuggestResult, UnprocessedSuggestion,
};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

// ============================================================================
// FAKE SAMPLERS
// ============================================================================

/// Sampler that hands out pre-scripted assignment vectors in order.
///
/// Each `propose` call takes up to `count` entries from the script. Once the
/// script is exhausted, calls return an empty batch.
#[derive(Debug)]
pub struct ScriptedSampler {
    kind: SamplerKind,
    script: Mutex<VecDeque<Assignments>>,
    calls: AtomicUsize,
}

impl ScriptedSampler {
    pub fn new(kind: SamplerKind, script: impl IntoIterator<Item = Assignments>) -> Self {
        Self {
            kind,
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `propose` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Entries not yet handed out.
    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ProposalSampler for ScriptedSampler {
    fn kind(&self) -> SamplerKind {
        self.kind
    }

    async fn propose(
        &self,
        experiment: &Experiment,
        _snapshot: &OptimizationSnapshot,
        count: usize,
    ) -> Result<Vec<UnprocessedSuggestion>, SamplerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().map_err(|_| SamplerError::Failed {
            kind: self.kind,
            reason: "script lock poisoned".to_string(),
        })?;
        let take = count.min(script.len());
        Ok(script
            .drain(..take)
            .map(|a| UnprocessedSuggestion::new(experiment.experiment_id, self.kind.source(), a))
            .collect())
    }
}

/// Sampler that always returns the same assignment vector.
#[derive(Debug)]
pub struct FixedSampler {
    kind: SamplerKind,
    assignments: Assignments,
    calls: AtomicUsize,
}

impl FixedSampler {
    pub fn new(kind: SamplerKind, assignments: Assignments) -> Self {
        Self {
            kind,
            assignments,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProposalSampler for FixedSampler {
    fn kind(&self) -> SamplerKind {
        self.kind
    }

    async fn propose(
        &self,
        experiment: &Experiment,
        _snapshot: &OptimizationSnapshot,
        count: usize,
    ) -> Result<Vec<UnprocessedSuggestion>, SamplerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..count)
            .map(|_| {
                UnprocessedSuggestion::new(
                    experiment.experiment_id,
                    self.kind.source(),
                    self.assignments.clone(),
                )
            })
            .collect())
    }
}

/// Sampler that always fails.
#[derive(Debug)]
pub struct FailingSampler {
    kind: SamplerKind,
    reason: String,
}

impl FailingSampler {
    pub fn new(kind: SamplerKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ProposalSampler for FailingSampler {
    fn kind(&self) -> SamplerKind {
        self.kind
    }

    async fn propose(
        &self,
        _experiment: &Experiment,
        _snapshot: &OptimizationSnapshot,
        _count: usize,
    ) -> Result<Vec<UnprocessedSuggestion>, SamplerError> {
        Err(SamplerError::Failed {
            kind: self.kind,
            reason: self.reason.clone(),
        })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating broker entity types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    // === Identity Type Generators ===

    /// Generate a random UUID (for generic ID generation).
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_experiment_id() -> impl Strategy<Value = ExperimentId> {
        arb_uuid().prop_map(ExperimentId::new)
    }

    // === Enum Generators ===

    /// Generate any Source variant.
    pub fn arb_source() -> impl Strategy<Value = Source> {
        proptest::sample::select(Source::ALL.to_vec())
    }

    /// Generate any SamplerKind variant.
    pub fn arb_sampler_kind() -> impl Strategy<Value = SamplerKind> {
        proptest::sample::select(SamplerKind::ALL.to_vec())
    }

    // === Assignment Generators ===

    pub fn arb_assignment_value() -> impl Strategy<Value = AssignmentValue> {
        prop_oneof![
            (-1.0e6f64..1.0e6).prop_map(AssignmentValue::Double),
            any::<i64>().prop_map(AssignmentValue::Int),
            "[a-z]{1,8}".prop_map(AssignmentValue::Categorical),
        ]
    }

    /// Assignment vectors with up to six named values.
    pub fn arb_assignments() -> impl Strategy<Value = Assignments> {
        proptest::collection::btree_map("[a-z][a-z0-9_]{0,7}", arb_assignment_value(), 0..6)
            .prop_map(|values| values.into_iter().collect())
    }

    /// Assignment vectors valid for [`fixtures::offline_experiment`].
    ///
    /// [`fixtures::offline_experiment`]: crate::fixtures::offline_experiment
    pub fn arb_offline_assignments() -> impl Strategy<Value = Assignments> {
        (0.0f64..=1.0, 1i64..=10, prop_oneof![Just("red"), Just("green")]).prop_map(
            |(x, n, color)| {
                Assignments::new()
                    .with("x", x)
                    .with("n", n)
                    .with("color", color)
            },
        )
    }

    pub fn arb_unprocessed_suggestion(
        experiment_id: ExperimentId,
    ) -> impl Strategy<Value = UnprocessedSuggestion> {
        (arb_source(), arb_assignments()).prop_map(move |(source, assignments)| {
            UnprocessedSuggestion::new(experiment_id, source, assignments)
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built experiments and configs for common testing scenarios.

    use super::*;
    use std::time::Duration;
    use suggestion_storage::CacheConfig;

    /// Model-based experiment: one double, one int, one categorical.
    pub fn offline_experiment() -> Experiment {
        Experiment::new(ExperimentId::now_v7(), ExperimentType::Offline)
            .with_parameter(Parameter::double("x", 0.0, 1.0))
            .with_parameter(Parameter::int("n", 1, 10))
            .with_parameter(Parameter::categorical("color", &["red", "green"]))
            .with_metric("accuracy", MetricStrategy::Optimize)
    }

    /// Single integer parameter `a` in `[1, 100]`.
    pub fn single_int_experiment() -> Experiment {
        Experiment::new(ExperimentId::now_v7(), ExperimentType::Offline)
            .with_parameter(Parameter::int("a", 1, 100))
            .with_metric("loss", MetricStrategy::Optimize)
    }

    pub fn random_experiment() -> Experiment {
        Experiment {
            experiment_type: ExperimentType::Random,
            ..offline_experiment()
        }
    }

    pub fn grid_experiment() -> Experiment {
        Experiment::new(ExperimentId::now_v7(), ExperimentType::Grid)
            .with_parameter(Parameter::double("x", 0.0, 1.0).with_grid(vec![0.0, 0.5, 1.0]))
            .with_parameter(Parameter::int("n", 1, 3).with_grid(vec![1.0, 2.0, 3.0]))
    }

    pub fn categorical_experiment() -> Experiment {
        Experiment::new(ExperimentId::now_v7(), ExperimentType::Offline)
            .with_parameter(Parameter::categorical("optimizer", &["sgd", "adam", "rmsprop"]))
            .with_parameter(Parameter::categorical("activation", &["relu", "tanh"]))
    }

    /// Search experiment: every metric is a constraint metric.
    pub fn search_experiment() -> Experiment {
        Experiment::new(ExperimentId::now_v7(), ExperimentType::Offline)
            .with_parameter(Parameter::double("x", 0.0, 1.0))
            .with_parameter(Parameter::double("y", 0.0, 1.0))
            .with_metric("feasible", MetricStrategy::Constraint)
    }

    /// `x + y <= 1` over the unit square.
    pub fn constrained_experiment() -> Experiment {
        Experiment::new(ExperimentId::now_v7(), ExperimentType::Offline)
            .with_parameter(Parameter::double("x", 0.0, 1.0))
            .with_parameter(Parameter::double("y", 0.0, 1.0))
            .with_linear_constraint(LinearConstraint {
                terms: vec![("x".to_string(), 1.0), ("y".to_string(), 1.0)],
                threshold: 1.0,
                kind: ConstraintKind::LessThan,
            })
    }

    /// `momentum` is only active when `optimizer = sgd`.
    pub fn conditional_experiment() -> Experiment {
        Experiment::new(ExperimentId::now_v7(), ExperimentType::Offline)
            .with_conditional("optimizer", &["sgd", "adam"])
            .with_parameter(Parameter::double("lr", 0.0001, 0.1))
            .with_parameter(Parameter::double("momentum", 0.0, 0.99).with_condition("optimizer", &["sgd"]))
    }

    pub fn prior_experiment() -> Experiment {
        Experiment::new(ExperimentId::now_v7(), ExperimentType::Offline).with_parameter(
            Parameter::double("x", 0.0, 1.0).with_prior(Prior::Normal {
                mean: 0.5,
                scale: 0.1,
            }),
        )
    }

    /// Cache config with short timeouts and near-zero backoff.
    pub fn fast_cache_config() -> CacheConfig {
        CacheConfig::new()
            .with_point_timeout(Duration::from_millis(100))
            .with_poll_interval(Duration::from_millis(5))
            .with_retry(RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            })
    }

    /// Default broker config with both repeat checks enabled.
    pub fn strict_broker_config() -> BrokerConfig {
        BrokerConfig::default()
            .with_ignore_repeated_suggestions(true)
            .with_alternate_ignore_repeated_suggestions(true)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for broker-specific validation.

    use super::*;

    /// Assert that a SuggestResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &SuggestResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that the queue claim ceiling was hit after `attempts` tries.
    #[track_caller]
    pub fn assert_could_not_process<T: std::fmt::Debug>(result: &SuggestResult<T>, attempts: u32) {
        match result {
            Err(SuggestError::CouldNotProcessSuggestion { attempts: a, .. }) => {
                assert_eq!(*a, attempts, "Wrong attempt count");
            }
            other => panic!("Expected CouldNotProcessSuggestion, got: {:?}", other),
        }
    }

    /// Assert that a SuggestResult is a sampler error.
    #[track_caller]
    pub fn assert_sampler_error<T: std::fmt::Debug>(result: &SuggestResult<T>) {
        match result {
            Err(SuggestError::Sampler(_)) => {}
            other => panic!("Expected Sampler error, got: {:?}", other),
        }
    }

    /// Assert that a repository result is a NotFound for `entity_type`.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(
        result: &Result<T, RepositoryError>,
        entity_type: EntityType,
    ) {
        match result {
            Err(RepositoryError::NotFound {
                entity_type: et, ..
            }) => {
                assert_eq!(*et, entity_type, "Wrong entity type in NotFound error");
            }
            other => panic!("Expected NotFound error for {:?}, got: {:?}", entity_type, other),
        }
    }

    /// Assert that no two assignment vectors in `rows` are identical.
    #[track_caller]
    pub fn assert_distinct_assignments<'a>(rows: impl IntoIterator<Item = &'a Assignments>) {
        let mut seen = std::collections::HashSet::new();
        for assignments in rows {
            assert!(
                seen.insert(assignments.fingerprint()),
                "Duplicate assignment vector: {}",
                assignments
            );
        }
    }
}
