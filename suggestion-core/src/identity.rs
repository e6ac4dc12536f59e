//! Identity types for suggestion entities

use chrono::{DateTime, Utc};
use std::fmt;
use std::hash::Hash;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash used for exact-assignment lookups.
pub type ContentHash = [u8; 32];

/// Namespace for deterministic ids of queue-derived suggestions.
///
/// Every request that converts the same queued entry derives the same
/// suggestion uuid, so a concurrent claim surfaces as a duplicate insert.
pub const QUEUED_SUGGESTION_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c3a_8b4e_4f7a_9c21_5e0d_b7a3_1c44);

/// Common behavior for strongly-typed entity identifiers.
pub trait EntityIdType: Copy + Eq + Hash + Ord + fmt::Display + fmt::Debug {
    /// Wrap a raw UUID.
    fn new(uuid: Uuid) -> Self;

    /// Get the raw UUID.
    fn as_uuid(&self) -> Uuid;

    /// Generate a new UUIDv7 id (timestamp-sortable).
    fn now_v7() -> Self {
        Self::new(Uuid::now_v7())
    }

    /// The nil id.
    fn nil() -> Self {
        Self::new(Uuid::nil())
    }
}

macro_rules! define_entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl EntityIdType for $name {
            fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

define_entity_id!(
    /// Identifier of an experiment.
    ExperimentId
);
define_entity_id!(
    /// Identifier of a generated candidate (the cache uuid).
    SuggestionId
);
define_entity_id!(
    /// Identifier of the durable "served" link.
    ProcessedSuggestionId
);
define_entity_id!(
    /// Identifier of a user-submitted queued suggestion.
    QueuedSuggestionId
);
define_entity_id!(
    /// Identifier of a reported observation.
    ObservationId
);
define_entity_id!(
    /// Identifier of one serve request.
    RequestId
);

impl SuggestionId {
    /// Deterministic id for the candidate derived from a queued entry.
    pub fn for_queued(queued_id: QueuedSuggestionId) -> Self {
        Self(Uuid::new_v5(
            &QUEUED_SUGGESTION_NAMESPACE,
            queued_id.as_uuid().as_bytes(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_v7_ids_are_v7() {
        let id = ExperimentId::now_v7();
        assert_eq!(id.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn test_ids_are_sortable() {
        let id1 = ProcessedSuggestionId::now_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = ProcessedSuggestionId::now_v7();
        assert!(id1 < id2);
    }

    #[test]
    fn test_queued_suggestion_id_is_deterministic() {
        let queued = QueuedSuggestionId::now_v7();
        assert_eq!(SuggestionId::for_queued(queued), SuggestionId::for_queued(queued));
        assert_ne!(
            SuggestionId::for_queued(queued),
            SuggestionId::for_queued(QueuedSuggestionId::now_v7())
        );
        assert_eq!(SuggestionId::for_queued(queued).as_uuid().get_version_num(), 5);
    }

    #[test]
    fn test_id_parse_and_display() {
        let id = SuggestionId::now_v7();
        let parsed: SuggestionId = id.to_string().parse().expect("parse should succeed");
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<SuggestionId>().is_err());
    }
}
