//! Enum types for suggestion entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// EXPERIMENT ENUMS
// ============================================================================

/// How an experiment's suggestions are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    /// Model-based optimization (the general case).
    #[default]
    Offline,
    /// Pure random search.
    Random,
    /// Exhaustive grid enumeration.
    Grid,
}

/// What the optimizer does with a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricStrategy {
    #[default]
    Optimize,
    Store,
    Constraint,
}

/// Direction of a linear constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// `sum(weight * value) >= threshold`
    GreaterThan,
    /// `sum(weight * value) <= threshold`
    LessThan,
}

/// Entity type discriminator used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Experiment,
    ProcessedSuggestion,
    QueuedSuggestion,
    Observation,
}

// ============================================================================
// SOURCE
// ============================================================================

/// Tag identifying which proposal strategy produced a suggestion.
///
/// Declaration order is serving priority: when several cached buckets hold
/// candidates, the broker prefers the bucket whose source sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Converted from a user-submitted queued suggestion.
    Queued,
    /// Random draw substituted for a colliding candidate.
    ConflictReplacement,
    /// Queue-backed re-ranking of model proposals (general phase).
    QueueReranking,
    /// Space-filling generator for search experiments.
    SpaceFillingSearch,
    /// Low-discrepancy phase.
    LowDiscrepancy,
    /// Grid enumeration.
    Grid,
    /// Categorical-only strategy.
    Categorical,
    /// Plain random.
    Random,
}

impl Source {
    /// Every source, in priority order.
    pub const ALL: [Source; 8] = [
        Source::Queued,
        Source::ConflictReplacement,
        Source::QueueReranking,
        Source::SpaceFillingSearch,
        Source::LowDiscrepancy,
        Source::Grid,
        Source::Categorical,
        Source::Random,
    ];

    /// Stable string form used in cache keys and the active-source set.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Source::Queued => "queued",
            Source::ConflictReplacement => "conflict_replacement",
            Source::QueueReranking => "queue_reranking",
            Source::SpaceFillingSearch => "space_filling_search",
            Source::LowDiscrepancy => "low_discrepancy",
            Source::Grid => "grid",
            Source::Categorical => "categorical",
            Source::Random => "random",
        }
    }

    /// Parse from the stable string form.
    pub fn from_db_str(s: &str) -> Result<Self, SourceParseError> {
        Source::ALL
            .iter()
            .copied()
            .find(|source| source.as_db_str() == s)
            .ok_or_else(|| SourceParseError(s.to_string()))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for Source {
    type Err = SourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid source string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceParseError(pub String);

impl fmt::Display for SourceParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid suggestion source: {}", self.0)
    }
}

impl std::error::Error for SourceParseError {}

// ============================================================================
// SAMPLER KIND
// ============================================================================

/// Closed set of proposal strategies the selector can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    Random,
    Grid,
    Categorical,
    LowDiscrepancy,
    SpaceFillingSearch,
    QueueReranking,
}

impl SamplerKind {
    pub const ALL: [SamplerKind; 6] = [
        SamplerKind::Random,
        SamplerKind::Grid,
        SamplerKind::Categorical,
        SamplerKind::LowDiscrepancy,
        SamplerKind::SpaceFillingSearch,
        SamplerKind::QueueReranking,
    ];

    /// The source tag candidates from this strategy carry.
    pub fn source(&self) -> Source {
        match self {
            SamplerKind::Random => Source::Random,
            SamplerKind::Grid => Source::Grid,
            SamplerKind::Categorical => Source::Categorical,
            SamplerKind::LowDiscrepancy => Source::LowDiscrepancy,
            SamplerKind::SpaceFillingSearch => Source::SpaceFillingSearch,
            SamplerKind::QueueReranking => Source::QueueReranking,
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_db_str_roundtrip() {
        for source in Source::ALL {
            assert_eq!(Source::from_db_str(source.as_db_str()), Ok(source));
        }
        assert!(Source::from_db_str("gaussian").is_err());
    }

    #[test]
    fn test_source_priority_follows_declaration_order() {
        assert!(Source::Queued < Source::ConflictReplacement);
        assert!(Source::QueueReranking < Source::LowDiscrepancy);
        assert!(Source::LowDiscrepancy < Source::Random);
        let mut shuffled = vec![Source::Random, Source::Queued, Source::Grid];
        shuffled.sort();
        assert_eq!(shuffled, vec![Source::Queued, Source::Grid, Source::Random]);
    }

    #[test]
    fn test_source_strings_are_key_safe() {
        for source in Source::ALL {
            assert!(!source.as_db_str().contains(':'));
        }
    }

    #[test]
    fn test_sampler_kind_sources_are_distinct() {
        let sources: std::collections::HashSet<Source> =
            SamplerKind::ALL.iter().map(|k| k.source()).collect();
        assert_eq!(sources.len(), SamplerKind::ALL.len());
        assert!(!sources.contains(&Source::ConflictReplacement));
        assert!(!sources.contains(&Source::Queued));
    }

    #[test]
    fn test_every_source_has_a_producer() {
        for source in Source::ALL {
            let produced = matches!(source, Source::Queued | Source::ConflictReplacement)
                || SamplerKind::ALL.iter().any(|k| k.source() == source);
            assert!(produced, "{} is never produced", source);
        }
    }

    #[test]
    fn test_source_parse_error_display() {
        let err = SourceParseError("bogus".to_string());
        assert!(err.to_string().contains("bogus"));
    }
}
