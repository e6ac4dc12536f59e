//! Shared broker wiring for integration tests.

use std::sync::Arc;

use suggestion_broker::{FixedStencil, RandomSampler, SamplerTable, SuggestionBroker};
use suggestion_core::BrokerConfig;
use suggestion_storage::{InMemoryCacheBackend, InMemorySuggestionRepository, SuggestionStore};
use suggestion_test_utils::fixtures;

pub type TestBroker = SuggestionBroker<InMemoryCacheBackend, InMemorySuggestionRepository>;

pub struct Harness {
    pub backend: Arc<InMemoryCacheBackend>,
    pub repository: Arc<InMemorySuggestionRepository>,
    pub broker: Arc<TestBroker>,
}

/// Broker over fresh in-memory backends. `stencil` is the low-discrepancy
/// stencil length for every experiment.
pub fn harness(samplers: SamplerTable, config: BrokerConfig, stencil: u64) -> Harness {
    let backend = Arc::new(InMemoryCacheBackend::default());
    let repository = Arc::new(InMemorySuggestionRepository::new());
    let store = Arc::new(SuggestionStore::new(
        backend.clone(),
        fixtures::fast_cache_config(),
        &config,
    ));
    let broker = SuggestionBroker::new(
        store,
        repository.clone(),
        samplers,
        Arc::new(FixedStencil(stencil)),
        config,
    )
    .expect("valid broker config")
    .with_replacement_sampler(Arc::new(RandomSampler::seeded(17)));

    Harness {
        backend,
        repository,
        broker: Arc::new(broker),
    }
}
