//! Suggestion Broker
//!
//! Serves optimization suggestions for long-running experiments. Each serve
//! call claims a queued user submission or draws one candidate through the
//! selected proposal strategy, links it to the request in the repository,
//! and repairs any duplicate that concurrent requests produced.
//!
//! - [`SamplerSelector`] maps experiment state to a [`SelectionPlan`]
//! - [`SamplerTable`] executes a plan against registered strategies
//! - [`ConflictResolver`] flags repeats and replaces colliding links
//! - [`SuggestionBroker`] ties them to the cache and the repository

mod broker;
mod conflict;
mod random;
mod samplers;
mod selector;

pub use broker::SuggestionBroker;
pub use conflict::ConflictResolver;
pub use random::{RandomSampler, MAX_CONSTRAINT_ATTEMPTS};
pub use samplers::SamplerTable;
pub use selector::{
    DimensionScaledStencil, FixedStencil, PlannedDraw, SamplerSelector, SelectionPlan,
    StencilPolicy,
};

pub use suggestion_core::{SuggestError, SuggestResult};
