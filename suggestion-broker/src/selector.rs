//! Proposal strategy selection.
//!
//! The selector resolves an experiment and its live state to a
//! [`SelectionPlan`]: an ordered list of strategy draws. It never draws
//! anything itself; [`crate::SamplerTable`] executes the plan.

use std::fmt;
use std::sync::Arc;

use suggestion_core::{
    Experiment, ExperimentType, OptimizationSnapshot, SamplerError, SamplerKind, Source,
};

// ============================================================================
// STENCIL LENGTH
// ============================================================================

/// Number of observations the low-discrepancy phase should cover.
pub trait StencilPolicy: Send + Sync {
    fn stencil_length(&self, experiment: &Experiment) -> u64;
}

/// The same stencil length for every experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedStencil(pub u64);

impl StencilPolicy for FixedStencil {
    fn stencil_length(&self, _experiment: &Experiment) -> u64 {
        self.0
    }
}

/// `per_dimension * dimension`, never below `minimum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionScaledStencil {
    pub per_dimension: u64,
    pub minimum: u64,
}

impl Default for DimensionScaledStencil {
    fn default() -> Self {
        Self {
            per_dimension: 2,
            minimum: 5,
        }
    }
}

impl StencilPolicy for DimensionScaledStencil {
    fn stencil_length(&self, experiment: &Experiment) -> u64 {
        (self.per_dimension * experiment.dimension() as u64).max(self.minimum)
    }
}

// ============================================================================
// SELECTION PLAN
// ============================================================================

/// One strategy and how many candidates to draw from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedDraw {
    pub kind: SamplerKind,
    pub count: usize,
}

/// Ordered draws for one call. Earlier phases are drawn first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionPlan {
    pub phases: Vec<PlannedDraw>,
}

impl SelectionPlan {
    pub fn single(kind: SamplerKind, count: usize) -> Self {
        Self {
            phases: vec![PlannedDraw { kind, count }],
        }
    }

    /// Total candidates across phases.
    pub fn total(&self) -> usize {
        self.phases.iter().map(|p| p.count).sum()
    }

    pub fn kinds(&self) -> Vec<SamplerKind> {
        self.phases.iter().map(|p| p.kind).collect()
    }

    /// Cache buckets this plan's candidates land in.
    pub fn sources(&self) -> Vec<Source> {
        self.phases.iter().map(|p| p.kind.source()).collect()
    }

    pub fn is_composite(&self) -> bool {
        self.phases.len() > 1
    }
}

impl fmt::Display for SelectionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, phase) in self.phases.iter().enumerate() {
            if i > 0 {
                write!(f, " + ")?;
            }
            write!(f, "{}x{}", phase.kind, phase.count)?;
        }
        Ok(())
    }
}

// ============================================================================
// SELECTOR
// ============================================================================

/// Chooses a proposal strategy from experiment configuration and state.
///
/// First match wins:
/// 1. development or random-typed experiments draw plain random
/// 2. grid-typed experiments enumerate the grid
/// 3. experiments without a non-categorical parameter draw categoricals
/// 4. everything else runs a low-discrepancy phase until the observation
///    count reaches the stencil length, then queue re-ranking; a call that
///    straddles the boundary gets both phases in that order
#[derive(Clone)]
pub struct SamplerSelector {
    stencil: Arc<dyn StencilPolicy>,
    require_low_discrepancy_draw: bool,
}

impl SamplerSelector {
    pub fn new(stencil: Arc<dyn StencilPolicy>) -> Self {
        Self {
            stencil,
            require_low_discrepancy_draw: false,
        }
    }

    /// Fail with `NoStrategy` when the low-discrepancy phase has nothing left.
    pub fn with_require_low_discrepancy_draw(mut self, required: bool) -> Self {
        self.require_low_discrepancy_draw = required;
        self
    }

    pub fn select(
        &self,
        experiment: &Experiment,
        snapshot: &OptimizationSnapshot,
        count: usize,
    ) -> Result<SelectionPlan, SamplerError> {
        let count = count.max(1);

        if experiment.development || experiment.experiment_type == ExperimentType::Random {
            return Ok(SelectionPlan::single(SamplerKind::Random, count));
        }
        if experiment.experiment_type == ExperimentType::Grid {
            return Ok(SelectionPlan::single(SamplerKind::Grid, count));
        }
        if !experiment.has_non_categorical_parameters() {
            return Ok(SelectionPlan::single(SamplerKind::Categorical, count));
        }

        let stencil = self.stencil.stencil_length(experiment);
        let remaining = stencil.saturating_sub(snapshot.observation_count);
        let low_discrepancy = (count as u64).min(remaining) as usize;

        if low_discrepancy == 0 && self.require_low_discrepancy_draw {
            return Err(SamplerError::NoStrategy);
        }

        let mut phases = Vec::with_capacity(2);
        if low_discrepancy > 0 {
            phases.push(PlannedDraw {
                kind: low_discrepancy_kind(experiment),
                count: low_discrepancy,
            });
        }
        if count > low_discrepancy {
            phases.push(PlannedDraw {
                kind: SamplerKind::QueueReranking,
                count: count - low_discrepancy,
            });
        }

        let plan = SelectionPlan { phases };
        tracing::debug!(
            experiment_id = %experiment.experiment_id,
            observations = snapshot.observation_count,
            stencil,
            plan = %plan,
            "Selected proposal strategy"
        );
        Ok(plan)
    }
}

impl fmt::Debug for SamplerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplerSelector")
            .field("require_low_discrepancy_draw", &self.require_low_discrepancy_draw)
            .finish_non_exhaustive()
    }
}

/// Strategy for the low-discrepancy phase.
fn low_discrepancy_kind(experiment: &Experiment) -> SamplerKind {
    if experiment.uses_priors()
        || experiment.has_linear_constraints()
        || experiment.prefers_alternate_scoring
    {
        SamplerKind::Random
    } else if experiment.is_search() && !experiment.has_conditionals() {
        SamplerKind::SpaceFillingSearch
    } else {
        SamplerKind::LowDiscrepancy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suggestion_test_utils::fixtures;

    fn selector(stencil: u64) -> SamplerSelector {
        SamplerSelector::new(Arc::new(FixedStencil(stencil)))
    }

    #[test]
    fn test_development_overrides_type() {
        let experiment = fixtures::grid_experiment().with_development(true);
        let plan = selector(10)
            .select(&experiment, &OptimizationSnapshot::default(), 1)
            .unwrap();
        assert_eq!(plan, SelectionPlan::single(SamplerKind::Random, 1));
    }

    #[test]
    fn test_random_grid_and_categorical() {
        let snapshot = OptimizationSnapshot::default();
        let s = selector(10);
        assert_eq!(
            s.select(&fixtures::random_experiment(), &snapshot, 1).unwrap().kinds(),
            vec![SamplerKind::Random]
        );
        assert_eq!(
            s.select(&fixtures::grid_experiment(), &snapshot, 1).unwrap().kinds(),
            vec![SamplerKind::Grid]
        );
        assert_eq!(
            s.select(&fixtures::categorical_experiment(), &snapshot, 1)
                .unwrap()
                .kinds(),
            vec![SamplerKind::Categorical]
        );
    }

    #[test]
    fn test_low_discrepancy_until_stencil_then_reranking() {
        let experiment = fixtures::offline_experiment();
        let s = selector(4);

        let early = s.select(&experiment, &OptimizationSnapshot::new(3), 1).unwrap();
        assert_eq!(early.kinds(), vec![SamplerKind::LowDiscrepancy]);

        let late = s.select(&experiment, &OptimizationSnapshot::new(4), 1).unwrap();
        assert_eq!(late.kinds(), vec![SamplerKind::QueueReranking]);
    }

    #[test]
    fn test_composite_when_batch_straddles_stencil() {
        let experiment = fixtures::offline_experiment();
        let plan = selector(4)
            .select(&experiment, &OptimizationSnapshot::new(2), 5)
            .unwrap();
        assert!(plan.is_composite());
        assert_eq!(
            plan.phases,
            vec![
                PlannedDraw {
                    kind: SamplerKind::LowDiscrepancy,
                    count: 2
                },
                PlannedDraw {
                    kind: SamplerKind::QueueReranking,
                    count: 3
                },
            ]
        );
        assert_eq!(plan.total(), 5);
        assert_eq!(
            plan.sources(),
            vec![Source::LowDiscrepancy, Source::QueueReranking]
        );
    }

    #[test]
    fn test_low_discrepancy_substitutes_random() {
        let snapshot = OptimizationSnapshot::default();
        let s = selector(10);
        for experiment in [
            fixtures::prior_experiment(),
            fixtures::constrained_experiment(),
            Experiment {
                prefers_alternate_scoring: true,
                ..fixtures::offline_experiment()
            },
        ] {
            assert_eq!(
                s.select(&experiment, &snapshot, 1).unwrap().kinds(),
                vec![SamplerKind::Random]
            );
        }
    }

    #[test]
    fn test_search_experiment_uses_space_filling() {
        let plan = selector(10)
            .select(&fixtures::search_experiment(), &OptimizationSnapshot::default(), 1)
            .unwrap();
        assert_eq!(plan.kinds(), vec![SamplerKind::SpaceFillingSearch]);

        let with_conditionals = fixtures::search_experiment().with_conditional("mode", &["a", "b"]);
        let plan = selector(10)
            .select(&with_conditionals, &OptimizationSnapshot::default(), 1)
            .unwrap();
        assert_eq!(plan.kinds(), vec![SamplerKind::LowDiscrepancy]);
    }

    #[test]
    fn test_required_low_discrepancy_draw_without_budget() {
        let experiment = fixtures::offline_experiment();
        let s = selector(3).with_require_low_discrepancy_draw(true);
        assert_eq!(
            s.select(&experiment, &OptimizationSnapshot::new(3), 1),
            Err(SamplerError::NoStrategy)
        );
        assert!(s.select(&experiment, &OptimizationSnapshot::new(2), 1).is_ok());
    }

    #[test]
    fn test_dimension_scaled_stencil() {
        let stencil = DimensionScaledStencil::default();
        assert_eq!(stencil.stencil_length(&fixtures::offline_experiment()), 6);
        assert_eq!(stencil.stencil_length(&fixtures::prior_experiment()), 5);
    }

    #[test]
    fn test_zero_count_draws_one() {
        let plan = selector(10)
            .select(&fixtures::random_experiment(), &OptimizationSnapshot::default(), 0)
            .unwrap();
        assert_eq!(plan.total(), 1);
    }
}
