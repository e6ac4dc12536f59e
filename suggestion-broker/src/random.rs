//! Uniform random proposals.

use std::sync::Mutex;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use suggestion_core::{
    AssignmentValue, Assignments, Experiment, OptimizationSnapshot, Parameter, ParameterKind,
    ProposalSampler, SamplerError, SamplerKind, UnprocessedSuggestion,
};

/// Draws per candidate before giving up on an experiment's constraints.
pub const MAX_CONSTRAINT_ATTEMPTS: usize = 1000;

/// Uniform sampler over an experiment's domain.
///
/// Conditionals are drawn first so that gated parameters are only assigned
/// when active. Grid values, when present, replace the continuous range.
/// Linear constraints are handled by rejection.
#[derive(Debug)]
pub struct RandomSampler {
    kind: SamplerKind,
    rng: Mutex<StdRng>,
}

impl RandomSampler {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_rng(&mut rand::rng()))
    }

    /// Deterministic sampler for tests and simulations.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            kind: SamplerKind::Random,
            rng: Mutex::new(rng),
        }
    }

    /// Register this sampler under another strategy slot. Candidates carry
    /// that strategy's source tag.
    pub fn acting_as(mut self, kind: SamplerKind) -> Self {
        self.kind = kind;
        self
    }

    /// One assignment vector that validates against `experiment`.
    pub fn draw_assignments(&self, experiment: &Experiment) -> Result<Assignments, SamplerError> {
        let mut rng = self.rng.lock().map_err(|_| SamplerError::Failed {
            kind: self.kind,
            reason: "rng lock poisoned".to_string(),
        })?;

        let mut last_error = None;
        for _ in 0..MAX_CONSTRAINT_ATTEMPTS {
            let assignments = self.draw_once(&mut rng, experiment)?;
            match experiment.validate_assignments(&assignments) {
                Ok(()) => return Ok(assignments),
                Err(e) => last_error = Some(e),
            }
        }

        Err(SamplerError::Failed {
            kind: self.kind,
            reason: match last_error {
                Some(e) => format!(
                    "no valid draw in {} attempts: {}",
                    MAX_CONSTRAINT_ATTEMPTS, e
                ),
                None => "no valid draw".to_string(),
            },
        })
    }

    fn draw_once(
        &self,
        rng: &mut StdRng,
        experiment: &Experiment,
    ) -> Result<Assignments, SamplerError> {
        let mut assignments = Assignments::new();

        for conditional in &experiment.conditionals {
            if conditional.values.is_empty() {
                return Err(self.empty_domain(&conditional.name));
            }
            let value = &conditional.values[rng.random_range(0..conditional.values.len())];
            assignments.insert(conditional.name.clone(), value.as_str());
        }

        for parameter in &experiment.parameters {
            if !parameter.is_active(&assignments) {
                continue;
            }
            let value = self.draw_value(rng, parameter)?;
            assignments.insert(parameter.name.clone(), value);
        }

        Ok(assignments)
    }

    fn draw_value(
        &self,
        rng: &mut StdRng,
        parameter: &Parameter,
    ) -> Result<AssignmentValue, SamplerError> {
        if let Some(grid) = parameter.grid.as_ref().filter(|g| !g.is_empty()) {
            let point = grid[rng.random_range(0..grid.len())];
            return Ok(match parameter.kind {
                ParameterKind::Int { .. } => AssignmentValue::Int(point.round() as i64),
                _ => AssignmentValue::Double(point),
            });
        }

        match &parameter.kind {
            ParameterKind::Double { min, max } => {
                if !(min.is_finite() && max.is_finite() && min <= max) {
                    return Err(self.empty_domain(&parameter.name));
                }
                if min == max {
                    return Ok(AssignmentValue::Double(*min));
                }
                Ok(AssignmentValue::Double(rng.random_range(*min..=*max)))
            }
            ParameterKind::Int { min, max } => {
                if min > max {
                    return Err(self.empty_domain(&parameter.name));
                }
                Ok(AssignmentValue::Int(rng.random_range(*min..=*max)))
            }
            ParameterKind::Categorical { values } => {
                if values.is_empty() {
                    return Err(self.empty_domain(&parameter.name));
                }
                Ok(AssignmentValue::Categorical(
                    values[rng.random_range(0..values.len())].clone(),
                ))
            }
        }
    }

    fn empty_domain(&self, name: &str) -> SamplerError {
        SamplerError::Failed {
            kind: self.kind,
            reason: format!("{} has an empty domain", name),
        }
    }
}

impl Default for RandomSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProposalSampler for RandomSampler {
    fn kind(&self) -> SamplerKind {
        self.kind
    }

    async fn propose(
        &self,
        experiment: &Experiment,
        _snapshot: &OptimizationSnapshot,
        count: usize,
    ) -> Result<Vec<UnprocessedSuggestion>, SamplerError> {
        (0..count.max(1))
            .map(|_| {
                self.draw_assignments(experiment).map(|assignments| {
                    UnprocessedSuggestion::new(
                        experiment.experiment_id,
                        self.kind.source(),
                        assignments,
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suggestion_core::{ExperimentId, ExperimentType, EntityIdType, Source};
    use suggestion_test_utils::fixtures;

    #[tokio::test]
    async fn test_draws_validate_against_experiment() {
        let sampler = RandomSampler::seeded(7);
        for experiment in [
            fixtures::offline_experiment(),
            fixtures::grid_experiment(),
            fixtures::categorical_experiment(),
            fixtures::constrained_experiment(),
            fixtures::conditional_experiment(),
        ] {
            let batch = sampler
                .propose(&experiment, &OptimizationSnapshot::default(), 20)
                .await
                .unwrap();
            assert_eq!(batch.len(), 20);
            for candidate in batch {
                assert_eq!(candidate.source, Source::Random);
                assert_eq!(candidate.experiment_id, experiment.experiment_id);
                assert!(experiment.validate_assignments(&candidate.assignments).is_ok());
            }
        }
    }

    #[tokio::test]
    async fn test_acting_as_tags_source() {
        let sampler = RandomSampler::seeded(1).acting_as(SamplerKind::LowDiscrepancy);
        let batch = sampler
            .propose(&fixtures::offline_experiment(), &OptimizationSnapshot::default(), 1)
            .await
            .unwrap();
        assert_eq!(sampler.kind(), SamplerKind::LowDiscrepancy);
        assert_eq!(batch[0].source, Source::LowDiscrepancy);
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let experiment = fixtures::offline_experiment();
        let a = RandomSampler::seeded(42).draw_assignments(&experiment).unwrap();
        let b = RandomSampler::seeded(42).draw_assignments(&experiment).unwrap();
        assert!(a.is_identical(&b));
    }

    #[test]
    fn test_conditional_gating() {
        let experiment = fixtures::conditional_experiment();
        let sampler = RandomSampler::seeded(3);
        for _ in 0..50 {
            let a = sampler.draw_assignments(&experiment).unwrap();
            let sgd = a.get("optimizer").and_then(AssignmentValue::as_categorical) == Some("sgd");
            assert_eq!(a.contains("momentum"), sgd);
        }
    }

    #[test]
    fn test_degenerate_range_returns_bound() {
        let experiment = Experiment::new(ExperimentId::now_v7(), ExperimentType::Offline)
            .with_parameter(Parameter::double("x", 0.25, 0.25));
        let a = RandomSampler::seeded(0).draw_assignments(&experiment).unwrap();
        assert_eq!(a.get("x"), Some(&AssignmentValue::Double(0.25)));
    }

    #[test]
    fn test_unsatisfiable_constraint_fails() {
        let experiment = Experiment::new(ExperimentId::now_v7(), ExperimentType::Offline)
            .with_parameter(Parameter::double("x", 0.0, 1.0))
            .with_linear_constraint(suggestion_core::LinearConstraint {
                terms: vec![("x".to_string(), 1.0)],
                threshold: 5.0,
                kind: suggestion_core::ConstraintKind::GreaterThan,
            });
        let err = RandomSampler::seeded(0)
            .draw_assignments(&experiment)
            .unwrap_err();
        assert!(matches!(err, SamplerError::Failed { kind: SamplerKind::Random, .. }));
    }

    #[test]
    fn test_empty_categorical_fails() {
        let experiment = Experiment::new(ExperimentId::now_v7(), ExperimentType::Offline)
            .with_parameter(Parameter::categorical("c", &[]));
        assert!(RandomSampler::seeded(0).draw_assignments(&experiment).is_err());
    }
}
