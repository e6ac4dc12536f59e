//! Strategy table keyed by [`SamplerKind`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use suggestion_core::{
    Experiment, OptimizationSnapshot, ProposalSampler, SamplerError, SamplerKind,
    UnprocessedSuggestion,
};

use crate::random::RandomSampler;
use crate::selector::SelectionPlan;

/// Registered proposal strategies.
#[derive(Clone, Default)]
pub struct SamplerTable {
    samplers: HashMap<SamplerKind, Arc<dyn ProposalSampler>>,
}

impl SamplerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table where every slot is a seeded uniform sampler. Used where the
    /// numeric strategies are not deployed, such as local simulation.
    pub fn random_stand_ins(seed: u64) -> Self {
        SamplerKind::ALL
            .into_iter()
            .enumerate()
            .fold(Self::new(), |table, (i, kind)| {
                table.with_sampler(Arc::new(
                    RandomSampler::seeded(seed.wrapping_add(i as u64)).acting_as(kind),
                ))
            })
    }

    /// Register `sampler` under its own kind, replacing any previous one.
    pub fn register(&mut self, sampler: Arc<dyn ProposalSampler>) {
        self.samplers.insert(sampler.kind(), sampler);
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn ProposalSampler>) -> Self {
        self.register(sampler);
        self
    }

    pub fn get(&self, kind: SamplerKind) -> Result<&Arc<dyn ProposalSampler>, SamplerError> {
        self.samplers
            .get(&kind)
            .ok_or(SamplerError::NotRegistered { kind })
    }

    pub fn contains(&self, kind: SamplerKind) -> bool {
        self.samplers.contains_key(&kind)
    }

    /// Run every phase of `plan` in order and concatenate the results.
    ///
    /// Each phase must yield at least one candidate; extras beyond the
    /// phase count are dropped. Every candidate is re-validated against the
    /// experiment before it is returned.
    pub async fn draw(
        &self,
        experiment: &Experiment,
        snapshot: &OptimizationSnapshot,
        plan: &SelectionPlan,
    ) -> Result<Vec<UnprocessedSuggestion>, SamplerError> {
        let mut drawn = Vec::with_capacity(plan.total());
        for phase in &plan.phases {
            let sampler = self.get(phase.kind)?;
            let mut batch = sampler.propose(experiment, snapshot, phase.count).await?;
            if batch.is_empty() {
                return Err(SamplerError::EmptyDraw { kind: phase.kind });
            }
            batch.truncate(phase.count.max(1));

            for candidate in &batch {
                if candidate.experiment_id != experiment.experiment_id {
                    return Err(SamplerError::InvalidCandidate {
                        kind: phase.kind,
                        reason: format!(
                            "candidate {} belongs to experiment {}",
                            candidate.uuid, candidate.experiment_id
                        ),
                    });
                }
                experiment
                    .validate_assignments(&candidate.assignments)
                    .map_err(|e| SamplerError::InvalidCandidate {
                        kind: phase.kind,
                        reason: e.to_string(),
                    })?;
            }
            drawn.extend(batch);
        }
        Ok(drawn)
    }
}

impl fmt::Debug for SamplerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.samplers.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("SamplerTable").field("kinds", &kinds).finish()
    }
}
