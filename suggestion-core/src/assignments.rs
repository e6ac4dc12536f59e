//! Parameter assignments: the payload of a suggestion.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::identity::ContentHash;

/// A single assigned value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentValue {
    Double(f64),
    Int(i64),
    Categorical(String),
}

impl AssignmentValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AssignmentValue::Double(v) => Some(*v),
            AssignmentValue::Int(v) => Some(*v as f64),
            AssignmentValue::Categorical(_) => None,
        }
    }

    /// Categorical view of the value, if it has one.
    pub fn as_categorical(&self) -> Option<&str> {
        match self {
            AssignmentValue::Categorical(v) => Some(v),
            _ => None,
        }
    }

    fn write_fingerprint(&self, hasher: &mut Sha256) {
        match self {
            AssignmentValue::Double(v) => {
                // -0.0 and 0.0 are the same assignment
                let normalized = if *v == 0.0 { 0.0f64 } else { *v };
                hasher.update([b'd']);
                hasher.update(normalized.to_bits().to_le_bytes());
            }
            AssignmentValue::Int(v) => {
                hasher.update([b'i']);
                hasher.update(v.to_le_bytes());
            }
            AssignmentValue::Categorical(v) => {
                hasher.update([b'c']);
                hasher.update((v.len() as u64).to_le_bytes());
                hasher.update(v.as_bytes());
            }
        }
    }
}

impl fmt::Display for AssignmentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignmentValue::Double(v) => write!(f, "{}", v),
            AssignmentValue::Int(v) => write!(f, "{}", v),
            AssignmentValue::Categorical(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<f64> for AssignmentValue {
    fn from(v: f64) -> Self {
        AssignmentValue::Double(v)
    }
}

impl From<i64> for AssignmentValue {
    fn from(v: i64) -> Self {
        AssignmentValue::Int(v)
    }
}

impl From<&str> for AssignmentValue {
    fn from(v: &str) -> Self {
        AssignmentValue::Categorical(v.to_string())
    }
}

impl From<String> for AssignmentValue {
    fn from(v: String) -> Self {
        AssignmentValue::Categorical(v)
    }
}

/// Name-ordered map of parameter (and conditional) names to values.
///
/// Two assignment vectors are identical when their fingerprints match.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Assignments(BTreeMap<String, AssignmentValue>);

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AssignmentValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<AssignmentValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AssignmentValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AssignmentValue)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// SHA-256 over the canonical encoding of every (name, value) pair.
    pub fn fingerprint(&self) -> ContentHash {
        let mut hasher = Sha256::new();
        for (name, value) in &self.0 {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            value.write_fingerprint(&mut hasher);
        }
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    }

    /// Short hex form of the fingerprint for log fields.
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(&self.fingerprint()[..8])
    }

    /// Whether both vectors assign exactly the same values.
    pub fn is_identical(&self, other: &Assignments) -> bool {
        self.len() == other.len() && self.fingerprint() == other.fingerprint()
    }
}

impl fmt::Display for Assignments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, AssignmentValue)> for Assignments {
    fn from_iter<I: IntoIterator<Item = (String, AssignmentValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
