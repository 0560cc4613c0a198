//! Persistence boundaries for pair history, exclusions and investigations.
//!
//! Components never depend on a concrete store. Each concern is a trait, and
//! two adapters implement all three:
//!
//! - [`MemoryWitnessStore`]: `RwLock`-guarded maps for tests and embedding.
//! - [`SqliteWitnessStore`]: `SQLite` in WAL mode for durable deployments.
//!
//! # Concurrency
//!
//! Check-then-act sequences that must not interleave live *inside* the store:
//! [`InvestigationStore::insert_unless_active`] gives idempotent trigger
//! placement per pair, and [`InvestigationStore::resolve_if_active`] is a
//! compare-and-set on the `ACTIVE` status. Callers never hold a lock across
//! an `.await`.

mod memory;
mod sqlite;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use memory::MemoryWitnessStore;
pub use sqlite::SqliteWitnessStore;
use thiserror::Error;

use crate::anomaly::PairExclusion;
use crate::investigation::{Investigation, InvestigationStatus};

/// Errors raised by store adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row could not be decoded.
    #[error("corrupt {entity} record {key}: {details}")]
    Corrupt {
        /// Kind of record.
        entity: &'static str,
        /// Primary key of the record.
        key: String,
        /// What was wrong with it.
        details: String,
    },

    /// A write conflicted with an existing record.
    #[error("conflicting {entity} record: {key}")]
    Conflict {
        /// Kind of record.
        entity: &'static str,
        /// Primary key of the record.
        key: String,
    },
}

/// Result of [`InvestigationStore::insert_unless_active`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The investigation was stored.
    Created(String),
    /// An `ACTIVE` investigation for the same pair already existed; its id
    /// is returned and nothing was written.
    Existing(String),
}

impl InsertOutcome {
    /// Returns the id of the stored or pre-existing investigation.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Created(id) | Self::Existing(id) => id,
        }
    }
}

/// Result of [`InvestigationStore::resolve_if_active`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The status moved from `ACTIVE` to the requested terminal status.
    Resolved,
    /// No investigation has that id.
    NotFound,
    /// The investigation was already terminal; nothing was written.
    AlreadyResolved(InvestigationStatus),
}

/// Storage for the last time each pair was selected together.
#[async_trait]
pub trait PairHistoryStore: Send + Sync {
    /// Inserts or refreshes the last-seen time of `pair_key`.
    async fn upsert_pair(&self, pair_key: &str, seen_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Returns the last-seen time of `pair_key`.
    async fn last_seen(&self, pair_key: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Removes entries last seen at or before `cutoff`. Returns the number
    /// removed.
    async fn remove_seen_at_or_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Returns the number of tracked pairs.
    async fn pair_count(&self) -> Result<usize, StoreError>;
}

/// Storage for time-boxed pair exclusions.
#[async_trait]
pub trait ExclusionStore: Send + Sync {
    /// Inserts or replaces the exclusion for its pair.
    async fn put_exclusion(&self, exclusion: PairExclusion) -> Result<(), StoreError>;

    /// Returns the exclusion for `pair_key`, expired or not.
    async fn get_exclusion(&self, pair_key: &str) -> Result<Option<PairExclusion>, StoreError>;

    /// Deletes the exclusion for `pair_key`. Returns true if one existed.
    async fn remove_exclusion(&self, pair_key: &str) -> Result<bool, StoreError>;

    /// Deletes exclusions whose `excluded_until` is at or before `now`.
    /// Idempotent; concurrent calls may both succeed.
    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Returns all stored exclusions ordered by pair key.
    async fn list_exclusions(&self) -> Result<Vec<PairExclusion>, StoreError>;
}

/// Storage for investigations and the permanent ban list.
#[async_trait]
pub trait InvestigationStore: Send + Sync {
    /// Stores `investigation` unless an `ACTIVE` investigation already exists
    /// for the same pair.
    async fn insert_unless_active(
        &self,
        investigation: Investigation,
    ) -> Result<InsertOutcome, StoreError>;

    /// Returns the investigation with `id`.
    async fn get(&self, id: &str) -> Result<Option<Investigation>, StoreError>;

    /// Returns the `ACTIVE` investigation for `pair_key`, if any.
    async fn active_for_pair(&self, pair_key: &str) -> Result<Option<Investigation>, StoreError>;

    /// Replaces the stored investigation with `resolved` only if the stored
    /// status is still `ACTIVE`. A `CONFIRMED` resolution also adds the pair
    /// to the ban list in the same write.
    async fn resolve_if_active(
        &self,
        resolved: &Investigation,
    ) -> Result<ResolveOutcome, StoreError>;

    /// Returns investigations with `status`, ordered by trigger time then id.
    async fn list_by_status(
        &self,
        status: InvestigationStatus,
    ) -> Result<Vec<Investigation>, StoreError>;

    /// Returns the permanently banned pair keys.
    async fn banned_pair_keys(&self) -> Result<BTreeSet<String>, StoreError>;
}
