//! Seed derivation and index computation.
//!
//! ```text
//! combined_seed = SHA-256(external_entropy || UTF-8(chain_hash))
//! retry_seed(n) = SHA-256(combined_seed || u32_be(n))        n >= 1
//! index         = u64_be(seed[0..8]) mod pool_size
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a derived seed in bytes.
pub const SEED_LEN: usize = 32;

/// A derived 32-byte seed.
pub type Seed = [u8; SEED_LEN];

/// Entropy, chain state and the seed derived from them.
///
/// Fields are private; a seed built by [`SelectionSeed::compute`] always
/// satisfies the derivation. One obtained by deserialization may not, which
/// is what [`crate::selection::verify`] checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSeed {
    #[serde(with = "hex_bytes")]
    external_entropy: Vec<u8>,
    chain_hash: String,
    #[serde(with = "hex_seed")]
    combined_seed: Seed,
}

impl SelectionSeed {
    /// Derives the combined seed from `external_entropy` and `chain_hash`.
    #[must_use]
    pub fn compute(external_entropy: Vec<u8>, chain_hash: impl Into<String>) -> Self {
        let chain_hash = chain_hash.into();
        let combined_seed = combine(&external_entropy, &chain_hash);
        Self {
            external_entropy,
            chain_hash,
            combined_seed,
        }
    }

    /// Raw entropy bytes.
    #[must_use]
    pub fn external_entropy(&self) -> &[u8] {
        &self.external_entropy
    }

    /// Chain hash (or `"genesis"`) mixed into the seed.
    #[must_use]
    pub fn chain_hash(&self) -> &str {
        &self.chain_hash
    }

    /// The combined seed.
    #[must_use]
    pub const fn combined_seed(&self) -> &Seed {
        &self.combined_seed
    }

    /// Returns the seed that picks the candidate for `attempt`: the
    /// combined seed for attempt 0, the retry seed otherwise.
    #[must_use]
    pub fn effective_seed(&self, attempt: u32) -> Seed {
        if attempt == 0 {
            self.combined_seed
        } else {
            retry_seed(&self.combined_seed, attempt)
        }
    }
}

/// Computes `SHA-256(entropy || chain_hash)`.
#[must_use]
pub fn combine(entropy: &[u8], chain_hash: &str) -> Seed {
    let mut hasher = Sha256::new();
    hasher.update(entropy);
    hasher.update(chain_hash.as_bytes());
    hasher.finalize().into()
}

/// Computes `SHA-256(combined_seed || u32_be(attempt))`.
#[must_use]
pub fn retry_seed(combined_seed: &Seed, attempt: u32) -> Seed {
    let mut hasher = Sha256::new();
    hasher.update(combined_seed);
    hasher.update(attempt.to_be_bytes());
    hasher.finalize().into()
}

/// Maps `seed` to an index in `0..pool_size`. Returns `None` for an empty
/// pool.
#[must_use]
#[expect(
    clippy::cast_possible_truncation,
    reason = "the remainder is below pool_size, which is a usize"
)]
pub fn seed_index(seed: &Seed, pool_size: usize) -> Option<usize> {
    if pool_size == 0 {
        return None;
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&seed[..8]);
    Some((u64::from_be_bytes(prefix) % pool_size as u64) as usize)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

mod hex_seed {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{SEED_LEN, Seed};

    pub fn serialize<S: Serializer>(seed: &Seed, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(seed))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Seed, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(text).map_err(serde::de::Error::custom)?;
        Seed::try_from(bytes.as_slice()).map_err(|_| {
            serde::de::Error::custom(format!("seed must be {SEED_LEN} bytes, got {}", bytes.len()))
        })
    }
}
