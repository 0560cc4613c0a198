//! Seams between the defense components and their consumers.
//!
//! The selector asks an [`ExclusionGate`] whether a candidate pair may be
//! used; the pool monitor asks [`ExcludedWitnessSource`]s which witnesses are
//! currently unusable. The anomaly detector and the collusion investigator
//! implement both, and [`CompositeExclusionGate`] joins them so a suspended
//! or banned pair is blocked exactly like a time-boxed exclusion.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::store::StoreError;
use crate::types::{WitnessId, WitnessPair};

/// Answers whether a pair is currently barred from selection.
#[async_trait]
pub trait ExclusionGate: Send + Sync {
    /// Returns true if `pair_key` must not be selected.
    async fn is_pair_blocked(&self, pair_key: &str) -> Result<bool, StoreError>;
}

/// Reports witnesses that should not count toward the effective pool.
#[async_trait]
pub trait ExcludedWitnessSource: Send + Sync {
    /// Returns the currently excluded witnesses.
    async fn excluded_witnesses(&self) -> Result<BTreeSet<WitnessId>, StoreError>;
}

/// Gate that blocks a pair when any member gate does.
#[derive(Clone, Default)]
pub struct CompositeExclusionGate {
    gates: Vec<Arc<dyn ExclusionGate>>,
}

impl std::fmt::Debug for CompositeExclusionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeExclusionGate")
            .field("gates", &self.gates.len())
            .finish()
    }
}

impl CompositeExclusionGate {
    /// Creates a gate over `gates`. An empty composite blocks nothing.
    #[must_use]
    pub fn new(gates: Vec<Arc<dyn ExclusionGate>>) -> Self {
        Self { gates }
    }

    /// Adds a member gate.
    #[must_use]
    pub fn with(mut self, gate: Arc<dyn ExclusionGate>) -> Self {
        self.gates.push(gate);
        self
    }

    /// Returns the number of member gates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// Returns true if there are no member gates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

#[async_trait]
impl ExclusionGate for CompositeExclusionGate {
    async fn is_pair_blocked(&self, pair_key: &str) -> Result<bool, StoreError> {
        for gate in &self.gates {
            if gate.is_pair_blocked(pair_key).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Collects the members of every parsable key in `pair_keys`.
///
/// Malformed keys are skipped; they can only come from foreign writers and
/// never block a witness that is not named by a valid pair.
pub(crate) fn members_of<'a>(pair_keys: impl IntoIterator<Item = &'a str>) -> BTreeSet<WitnessId> {
    let mut members = BTreeSet::new();
    for key in pair_keys {
        match WitnessPair::from_canonical_key(key) {
            Ok(pair) => {
                members.insert(pair.first().clone());
                members.insert(pair.second().clone());
            },
            Err(e) => {
                tracing::warn!(pair_key = key, error = %e, "skipping malformed stored pair key");
            },
        }
    }
    members
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    struct FixedGate(HashSet<&'static str>);

    #[async_trait]
    impl ExclusionGate for FixedGate {
        async fn is_pair_blocked(&self, pair_key: &str) -> Result<bool, StoreError> {
            Ok(self.0.contains(pair_key))
        }
    }

    #[tokio::test]
    async fn composite_blocks_when_any_member_blocks() {
        let gate = CompositeExclusionGate::default()
            .with(Arc::new(FixedGate(HashSet::from(["a:b"]))))
            .with(Arc::new(FixedGate(HashSet::from(["c:d"]))));

        assert_eq!(gate.len(), 2);
        assert!(gate.is_pair_blocked("a:b").await.unwrap());
        assert!(gate.is_pair_blocked("c:d").await.unwrap());
        assert!(!gate.is_pair_blocked("a:c").await.unwrap());
    }

    #[tokio::test]
    async fn empty_composite_blocks_nothing() {
        let gate = CompositeExclusionGate::new(vec![]);
        assert!(gate.is_empty());
        assert!(!gate.is_pair_blocked("a:b").await.unwrap());
    }

    #[test]
    fn members_skip_malformed_keys() {
        let members = members_of(["a:b", "b:c", "broken"]);
        let ids: Vec<&str> = members.iter().map(WitnessId::as_str).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
