//! Concurrent serving simulation.
//!
//! Runs many `serve_suggestion` calls against one experiment over in-memory
//! backends and reports how many served assignment vectors were duplicated.
//! Exits non-zero when any duplicate or failed call is observed.
//!
//! Usage:
//!   SUGGEST_SIM_REQUESTS=200 RUST_LOG=suggestion_broker=debug \
//!     cargo run -p suggestion-broker --bin suggest-sim
//!
//! Environment variables:
//! - `SUGGEST_SIM_REQUESTS` (default: 64)
//! - `SUGGEST_SIM_QUEUED` (default: 4)
//! - `SUGGEST_SIM_SEED` (default: 0)
//! - `SUGGEST_LOG_JSON` (default: false)
//! - every `SUGGEST_*` broker and `SUGGEST_CACHE_*` cache variable

use std::collections::HashMap;
use std::sync::Arc;

use suggestion_broker::{DimensionScaledStencil, RandomSampler, SamplerTable, SuggestionBroker};
use suggestion_core::{
    Assignments, BrokerConfig, EntityIdType, Experiment, ExperimentId, ExperimentType,
    MetricStrategy, Parameter, QueuedSuggestion, RequestMeta, SuggestResult,
};
use suggestion_storage::{
    CacheConfig, InMemoryCacheBackend, InMemorySuggestionRepository, SuggestionRepository,
    SuggestionStore,
};
use tokio::task::JoinSet;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SUGGEST_LOG_JSON")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to init subscriber: {}", e);
    }
}

fn demo_experiment() -> Experiment {
    Experiment::new(ExperimentId::now_v7(), ExperimentType::Offline)
        .with_parameter(Parameter::double("learning_rate", 0.0001, 0.1))
        .with_parameter(Parameter::int("layers", 1, 8))
        .with_parameter(Parameter::categorical("activation", &["relu", "tanh", "gelu"]))
        .with_metric("accuracy", MetricStrategy::Optimize)
        .with_parallel_bandwidth(16)
}

#[tokio::main]
async fn main() -> SuggestResult<()> {
    init_tracing();

    let requests: usize = env_or("SUGGEST_SIM_REQUESTS", 64);
    let queued: usize = env_or("SUGGEST_SIM_QUEUED", 4);
    let seed: u64 = env_or("SUGGEST_SIM_SEED", 0);

    let config = BrokerConfig::from_env();
    let cache_config = CacheConfig::from_env();
    cache_config.validate()?;

    let store = Arc::new(SuggestionStore::new(
        Arc::new(InMemoryCacheBackend::default()),
        cache_config,
        &config,
    ));
    let repository = Arc::new(InMemorySuggestionRepository::new());
    let broker = Arc::new(
        SuggestionBroker::new(
            store,
            repository,
            SamplerTable::random_stand_ins(seed),
            Arc::new(DimensionScaledStencil::default()),
            config,
        )?
        .with_replacement_sampler(Arc::new(RandomSampler::seeded(seed ^ 0x5eed))),
    );
    let experiment = Arc::new(demo_experiment());

    for i in 0..queued {
        let assignments = Assignments::new()
            .with("learning_rate", 0.01)
            .with("layers", (i % 8 + 1) as i64)
            .with("activation", "relu");
        broker
            .repository()
            .queued_insert(&QueuedSuggestion::new(experiment.experiment_id, assignments))
            .await?;
    }

    let snapshot = broker.load_snapshot(&experiment).await?;
    broker.replenish(&experiment, &snapshot).await?;

    tracing::info!(
        experiment_id = %experiment.experiment_id,
        requests,
        queued,
        "Starting concurrent serves"
    );

    let mut tasks = JoinSet::new();
    for i in 0..requests {
        let broker = broker.clone();
        let experiment = experiment.clone();
        tasks.spawn(async move {
            let meta = RequestMeta::new().with_client(format!("worker-{}", i));
            broker.serve_suggestion(&experiment, &meta).await
        });
    }

    let mut failures = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                failures += 1;
                tracing::error!(error = %e, "Serve failed");
            }
            Err(e) => {
                failures += 1;
                tracing::error!(error = %e, "Serve task panicked");
            }
        }
    }

    let served = broker.repository().processed_list(experiment.experiment_id).await;
    let mut by_vector: HashMap<String, usize> = HashMap::new();
    for processed in &served {
        *by_vector
            .entry(processed.assignments.fingerprint_hex())
            .or_default() += 1;
    }
    let duplicates: usize = by_vector.values().filter(|n| **n > 1).map(|n| n - 1).sum();
    let mut by_source: HashMap<String, usize> = HashMap::new();
    for processed in &served {
        *by_source.entry(processed.source.to_string()).or_default() += 1;
    }

    tracing::info!(
        served = served.len(),
        failures,
        duplicates,
        sources = ?by_source,
        "Simulation finished"
    );

    if duplicates > 0 || failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
