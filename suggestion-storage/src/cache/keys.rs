//! Closed set of suggestion cache keys.
//!
//! Every key the store touches is built here. Backends accept a [`CacheKey`],
//! never a raw string, so a key that does not belong to an experiment bucket
//! cannot be written.

use std::fmt;

use suggestion_core::{EntityIdType, ExperimentId, Source};
use uuid::Uuid;

/// Namespace and layout version shared by every key.
const PREFIX: &str = "suggestions:v1";

/// A key in the suggestion cache.
///
/// # Text Format
///
/// - `suggestions:v1:<experiment>:sources`
/// - `suggestions:v1:<experiment>:<source>:timestamps`
/// - `suggestions:v1:<experiment>:<source>:payloads`
///
/// Source strings never contain `:`, so decoding is unambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// Set of sources holding candidates for the experiment.
    ActiveSources { experiment_id: ExperimentId },
    /// Sorted index: uuid scored by generation time.
    Timestamps {
        experiment_id: ExperimentId,
        source: Source,
    },
    /// Map: uuid to serialized candidate.
    Payloads {
        experiment_id: ExperimentId,
        source: Source,
    },
}

impl CacheKey {
    pub fn active_sources(experiment_id: ExperimentId) -> Self {
        CacheKey::ActiveSources { experiment_id }
    }

    pub fn timestamps(experiment_id: ExperimentId, source: Source) -> Self {
        CacheKey::Timestamps {
            experiment_id,
            source,
        }
    }

    pub fn payloads(experiment_id: ExperimentId, source: Source) -> Self {
        CacheKey::Payloads {
            experiment_id,
            source,
        }
    }

    /// Both per-bucket keys for one experiment+source.
    pub fn bucket(experiment_id: ExperimentId, source: Source) -> [CacheKey; 2] {
        [
            Self::timestamps(experiment_id, source),
            Self::payloads(experiment_id, source),
        ]
    }

    pub fn experiment_id(&self) -> ExperimentId {
        match self {
            CacheKey::ActiveSources { experiment_id }
            | CacheKey::Timestamps { experiment_id, .. }
            | CacheKey::Payloads { experiment_id, .. } => *experiment_id,
        }
    }

    /// The bucket source, if this is a per-bucket key.
    pub fn source(&self) -> Option<Source> {
        match self {
            CacheKey::ActiveSources { .. } => None,
            CacheKey::Timestamps { source, .. } | CacheKey::Payloads { source, .. } => {
                Some(*source)
            }
        }
    }

    /// Encode to the wire form.
    pub fn encode(&self) -> String {
        match self {
            CacheKey::ActiveSources { experiment_id } => {
                format!("{}:{}:sources", PREFIX, experiment_id)
            }
            CacheKey::Timestamps {
                experiment_id,
                source,
            } => format!(
                "{}:{}:{}:timestamps",
                PREFIX,
                experiment_id,
                source.as_db_str()
            ),
            CacheKey::Payloads {
                experiment_id,
                source,
            } => format!(
                "{}:{}:{}:payloads",
                PREFIX,
                experiment_id,
                source.as_db_str()
            ),
        }
    }

    /// Decode from the wire form.
    ///
    /// Returns `None` if the prefix, the experiment uuid, the source, or the
    /// suffix is not recognized.
    pub fn decode(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(PREFIX)?.strip_prefix(':')?;
        let parts: Vec<&str> = rest.split(':').collect();
        match parts.as_slice() {
            [experiment, "sources"] => {
                let experiment_id = ExperimentId::new(Uuid::parse_str(experiment).ok()?);
                Some(CacheKey::ActiveSources { experiment_id })
            }
            [experiment, source, suffix] => {
                let experiment_id = ExperimentId::new(Uuid::parse_str(experiment).ok()?);
                let source = Source::from_db_str(source).ok()?;
                match *suffix {
                    "timestamps" => Some(CacheKey::Timestamps {
                        experiment_id,
                        source,
                    }),
                    "payloads" => Some(CacheKey::Payloads {
                        experiment_id,
                        source,
                    }),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Prefix shared by every key of one experiment.
    pub fn experiment_prefix(experiment_id: ExperimentId) -> String {
        format!("{}:{}:", PREFIX, experiment_id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
