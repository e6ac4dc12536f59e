//! Proposal strategy contract

use async_trait::async_trait;

use crate::{Experiment, OptimizationSnapshot, SamplerError, SamplerKind, UnprocessedSuggestion};

/// A proposal strategy.
///
/// Implementations return at least one candidate per call, each tagged with
/// the strategy's source, within bounds, inside categorical and grid domains,
/// respecting conditional gating and linear constraints. Calls must be safe
/// to retry.
#[async_trait]
pub trait ProposalSampler: Send + Sync {
    /// The strategy this sampler implements.
    fn kind(&self) -> SamplerKind;

    /// Draw `count` candidates.
    async fn propose(
        &self,
        experiment: &Experiment,
        snapshot: &OptimizationSnapshot,
        count: usize,
    ) -> Result<Vec<UnprocessedSuggestion>, SamplerError>;
}
