//! Suggestion Storage
//!
//! Two persistence surfaces for the broker:
//! - [`SuggestionStore`]: the expiring, per-source cache of generated
//!   candidates, built over any [`CacheBackend`].
//! - [`SuggestionRepository`]: the relational boundary for served links,
//!   the user queue, and observations.

pub mod cache;
pub mod repository;
pub mod suggestion_store;

pub use cache::{
    CacheBackend, CacheConfig, CacheKey, CacheOp, CachePolicy, CacheStats, InMemoryCacheBackend,
    DEFAULT_ENTRY_TTL,
};
pub use repository::{InMemorySuggestionRepository, SuggestionRepository};
pub use suggestion_store::{Awaited, CachedSuggestionRecord, Cleanup, Stored, SuggestionStore};
