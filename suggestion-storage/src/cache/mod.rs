//! Suggestion cache layer.
//!
//! Cache keys come from the closed [`CacheKey`] enumeration, so every value
//! lives in an experiment-scoped bucket. Backend calls go through
//! [`CachePolicy`], which bounds each attempt with the point timeout and
//! retries transient failures.

pub mod config;
pub mod keys;
pub mod memory;
pub mod policy;
pub mod traits;

pub use config::{CacheConfig, DEFAULT_ENTRY_TTL};
pub use keys::CacheKey;
pub use memory::{CacheOp, InMemoryCacheBackend};
pub use policy::CachePolicy;
pub use traits::{CacheBackend, CacheStats};
