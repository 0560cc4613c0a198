//! Witness identity and pair primitives.
//!
//! A [`WitnessId`] is an opaque identifier whose lexicographic (byte) order
//! defines every deterministic ordering in the crate: pool snapshots, pair
//! keys, and scan detection order.
//!
//! A [`WitnessPair`] is unordered. `(A, B)` and `(B, A)` compare equal, hash
//! equal, and render the same canonical key, so every store that tracks pairs
//! keys them by [`WitnessPair::canonical_key`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, de};
use thiserror::Error;

/// Delimiter placed between the two sorted ids of a canonical pair key.
pub const PAIR_KEY_DELIMITER: char = ':';

/// Errors produced when parsing identifiers or pair keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdentityError {
    /// A witness id was empty.
    #[error("witness id must not be empty")]
    EmptyWitnessId,

    /// A witness id contained the pair-key delimiter.
    #[error("witness id {id:?} contains the reserved ':' delimiter")]
    ReservedDelimiter {
        /// The offending id.
        id: String,
    },

    /// A pair key did not contain exactly two non-empty ids.
    #[error("malformed pair key: {key}")]
    MalformedPairKey {
        /// The offending key.
        key: String,
    },

    /// A pair key was not in canonical (sorted) order.
    #[error("pair key is not canonical: {key} (expected {expected})")]
    NonCanonicalPairKey {
        /// The offending key.
        key: String,
        /// The canonical form of the same pair.
        expected: String,
    },
}

/// Opaque witness identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct WitnessId(String);

impl<'de> Deserialize<'de> for WitnessId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Self::new(String::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

impl WitnessId {
    /// Creates a witness id.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::EmptyWitnessId`] if `id` is empty and
    /// [`IdentityError::ReservedDelimiter`] if it contains
    /// [`PAIR_KEY_DELIMITER`], which would make pair keys ambiguous.
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentityError::EmptyWitnessId);
        }
        if id.contains(PAIR_KEY_DELIMITER) {
            return Err(IdentityError::ReservedDelimiter { id });
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WitnessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WitnessId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unordered pair of witnesses.
///
/// The constructor stores the members in sorted order, so the derived
/// equality and hashing are already symmetric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WitnessPair {
    low: WitnessId,
    high: WitnessId,
}

impl WitnessPair {
    /// Creates a pair from two witnesses in any order.
    #[must_use]
    pub fn new(a: WitnessId, b: WitnessId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// Parses a canonical pair key back into a pair.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::MalformedPairKey`] if the key does not split
    /// into two non-empty ids, or [`IdentityError::NonCanonicalPairKey`] if
    /// the ids are not in sorted order.
    pub fn from_canonical_key(key: &str) -> Result<Self, IdentityError> {
        let malformed = || IdentityError::MalformedPairKey {
            key: key.to_string(),
        };
        let (first, second) = key.split_once(PAIR_KEY_DELIMITER).ok_or_else(malformed)?;
        if second.contains(PAIR_KEY_DELIMITER) {
            return Err(malformed());
        }
        let first = WitnessId::new(first).map_err(|_| malformed())?;
        let second = WitnessId::new(second).map_err(|_| malformed())?;
        let pair = Self::new(first.clone(), second);
        if pair.low != first {
            return Err(IdentityError::NonCanonicalPairKey {
                key: key.to_string(),
                expected: pair.canonical_key(),
            });
        }
        Ok(pair)
    }

    /// Returns the canonical key: sorted ids joined by [`PAIR_KEY_DELIMITER`].
    #[must_use]
    pub fn canonical_key(&self) -> String {
        canonical_key(&self.low, &self.high)
    }

    /// Returns the lexicographically smaller member.
    #[must_use]
    pub const fn first(&self) -> &WitnessId {
        &self.low
    }

    /// Returns the lexicographically larger member.
    #[must_use]
    pub const fn second(&self) -> &WitnessId {
        &self.high
    }

    /// Returns true if `witness` is a member of this pair.
    #[must_use]
    pub fn contains(&self, witness: &WitnessId) -> bool {
        &self.low == witness || &self.high == witness
    }

    /// Returns true if both members are the same witness.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.low == self.high
    }
}

impl fmt::Display for WitnessPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_key())
    }
}

/// Builds the canonical key for two witnesses given in any order.
#[must_use]
pub fn canonical_key(a: &WitnessId, b: &WitnessId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{low}{PAIR_KEY_DELIMITER}{high}")
}

/// Returns every pair that can be formed from `witnesses`, in ascending
/// canonical-key order. Duplicate ids are ignored.
#[must_use]
pub fn pairs_of(witnesses: &[WitnessId]) -> Vec<WitnessPair> {
    let mut sorted: Vec<&WitnessId> = witnesses.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut pairs = Vec::with_capacity(sorted.len() * sorted.len().saturating_sub(1) / 2);
    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            pairs.push(WitnessPair::new((*a).clone(), (*b).clone()));
        }
    }
    pairs
}
