//! In-memory store adapter.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ExclusionStore, InsertOutcome, InvestigationStore, PairHistoryStore, ResolveOutcome,
    StoreError,
};
use crate::anomaly::PairExclusion;
use crate::investigation::{Investigation, InvestigationStatus, Resolution};

#[derive(Debug, Default)]
struct InvestigationTables {
    by_id: HashMap<String, Investigation>,
    active_by_pair: HashMap<String, String>,
    banned: BTreeSet<String>,
}

/// `RwLock`-guarded implementation of every store trait.
///
/// Each trait method takes its lock for the duration of one synchronous
/// section, so check-then-act sequences are atomic with respect to other
/// callers of the same store.
#[derive(Debug, Default)]
pub struct MemoryWitnessStore {
    pairs: RwLock<HashMap<String, DateTime<Utc>>>,
    exclusions: RwLock<BTreeMap<String, PairExclusion>>,
    investigations: RwLock<InvestigationTables>,
}

impl MemoryWitnessStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PairHistoryStore for MemoryWitnessStore {
    async fn upsert_pair(&self, pair_key: &str, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.pairs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pair_key.to_string(), seen_at);
        Ok(())
    }

    async fn last_seen(&self, pair_key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .pairs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pair_key)
            .copied())
    }

    async fn remove_seen_at_or_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut pairs = self.pairs.write().unwrap_or_else(PoisonError::into_inner);
        let before = pairs.len();
        pairs.retain(|_, seen_at| *seen_at > cutoff);
        Ok(before - pairs.len())
    }

    async fn pair_count(&self) -> Result<usize, StoreError> {
        Ok(self.pairs.read().unwrap_or_else(PoisonError::into_inner).len())
    }
}

#[async_trait]
impl ExclusionStore for MemoryWitnessStore {
    async fn put_exclusion(&self, exclusion: PairExclusion) -> Result<(), StoreError> {
        self.exclusions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(exclusion.pair_key.clone(), exclusion);
        Ok(())
    }

    async fn get_exclusion(&self, pair_key: &str) -> Result<Option<PairExclusion>, StoreError> {
        Ok(self
            .exclusions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pair_key)
            .cloned())
    }

    async fn remove_exclusion(&self, pair_key: &str) -> Result<bool, StoreError> {
        Ok(self
            .exclusions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pair_key)
            .is_some())
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut exclusions = self
            .exclusions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = exclusions.len();
        exclusions.retain(|_, exclusion| !exclusion.is_expired(now));
        Ok(before - exclusions.len())
    }

    async fn list_exclusions(&self) -> Result<Vec<PairExclusion>, StoreError> {
        Ok(self
            .exclusions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InvestigationStore for MemoryWitnessStore {
    async fn insert_unless_active(
        &self,
        investigation: Investigation,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tables = self
            .investigations
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = tables.active_by_pair.get(investigation.pair_key()) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        if tables.by_id.contains_key(investigation.id()) {
            return Err(StoreError::Conflict {
                entity: "investigation",
                key: investigation.id().to_string(),
            });
        }

        let id = investigation.id().to_string();
        if investigation.is_active() {
            tables
                .active_by_pair
                .insert(investigation.pair_key().to_string(), id.clone());
        }
        tables.by_id.insert(id.clone(), investigation);
        Ok(InsertOutcome::Created(id))
    }

    async fn get(&self, id: &str) -> Result<Option<Investigation>, StoreError> {
        Ok(self
            .investigations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(id)
            .cloned())
    }

    async fn active_for_pair(&self, pair_key: &str) -> Result<Option<Investigation>, StoreError> {
        let tables = self
            .investigations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .active_by_pair
            .get(pair_key)
            .and_then(|id| tables.by_id.get(id))
            .cloned())
    }

    async fn resolve_if_active(
        &self,
        resolved: &Investigation,
    ) -> Result<ResolveOutcome, StoreError> {
        let mut tables = self
            .investigations
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(current) = tables.by_id.get(resolved.id()) else {
            return Ok(ResolveOutcome::NotFound);
        };
        if current.status().is_terminal() {
            return Ok(ResolveOutcome::AlreadyResolved(current.status()));
        }

        let pair_key = current.pair_key().to_string();
        tables.active_by_pair.remove(&pair_key);
        if resolved.resolution() == Some(Resolution::Confirmed) {
            tables.banned.insert(pair_key);
        }
        tables
            .by_id
            .insert(resolved.id().to_string(), resolved.clone());
        Ok(ResolveOutcome::Resolved)
    }

    async fn list_by_status(
        &self,
        status: InvestigationStatus,
    ) -> Result<Vec<Investigation>, StoreError> {
        let tables = self
            .investigations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<Investigation> = tables
            .by_id
            .values()
            .filter(|inv| inv.status() == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.triggered_at()
                .cmp(&b.triggered_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(matching)
    }

    async fn banned_pair_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .investigations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .banned
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
    }

    fn open(id: &str, pair: &str) -> Investigation {
        Investigation::open(id, pair, t0(), vec![], vec![], 0.9)
    }

    #[tokio::test]
    async fn pair_upsert_refreshes_timestamp() {
        let store = MemoryWitnessStore::new();
        store.upsert_pair("a:b", t0()).await.unwrap();
        store
            .upsert_pair("a:b", t0() + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(store.pair_count().await.unwrap(), 1);
        assert_eq!(
            store.last_seen("a:b").await.unwrap(),
            Some(t0() + Duration::hours(1))
        );
    }

    #[tokio::test]
    async fn prune_removes_only_old_pairs() {
        let store = MemoryWitnessStore::new();
        store.upsert_pair("a:b", t0()).await.unwrap();
        store
            .upsert_pair("a:c", t0() + Duration::hours(2))
            .await
            .unwrap();

        assert_eq!(store.remove_seen_at_or_before(t0()).await.unwrap(), 1);
        assert_eq!(store.last_seen("a:b").await.unwrap(), None);
        assert!(store.last_seen("a:c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_active_investigation_returns_existing() {
        let store = MemoryWitnessStore::new();
        let first = store.insert_unless_active(open("i1", "a:b")).await.unwrap();
        let second = store.insert_unless_active(open("i2", "a:b")).await.unwrap();

        assert_eq!(first, InsertOutcome::Created("i1".to_string()));
        assert_eq!(second, InsertOutcome::Existing("i1".to_string()));
        assert!(store.get("i2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_is_compare_and_set() {
        let store = MemoryWitnessStore::new();
        let inv = open("i1", "a:b");
        store.insert_unless_active(inv.clone()).await.unwrap();

        let confirmed = inv
            .resolved(Resolution::Confirmed, "proven", "auditor", t0())
            .unwrap();
        assert_eq!(
            store.resolve_if_active(&confirmed).await.unwrap(),
            ResolveOutcome::Resolved
        );

        let cleared = inv
            .resolved(Resolution::Cleared, "overwrite", "auditor", t0())
            .unwrap();
        assert_eq!(
            store.resolve_if_active(&cleared).await.unwrap(),
            ResolveOutcome::AlreadyResolved(InvestigationStatus::Confirmed)
        );

        let stored = store.get("i1").await.unwrap().unwrap();
        assert_eq!(stored.status(), InvestigationStatus::Confirmed);
        assert!(store.banned_pair_keys().await.unwrap().contains("a:b"));
        assert!(store.active_for_pair("a:b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_unknown_investigation() {
        let store = MemoryWitnessStore::new();
        let ghost = open("ghost", "a:b")
            .resolved(Resolution::Cleared, "", "", t0())
            .unwrap();
        assert_eq!(
            store.resolve_if_active(&ghost).await.unwrap(),
            ResolveOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn expired_exclusions_are_removed() {
        let store = MemoryWitnessStore::new();
        let exclusion = PairExclusion::new("a:b", t0(), Duration::hours(1), "test", 0.8).unwrap();
        store.put_exclusion(exclusion).await.unwrap();

        assert_eq!(store.remove_expired(t0()).await.unwrap(), 0);
        assert_eq!(
            store
                .remove_expired(t0() + Duration::hours(1))
                .await
                .unwrap(),
            1
        );
        assert!(store.list_exclusions().await.unwrap().is_empty());
    }
}
