//! `SQLite`-backed store adapter.
//!
//! One connection guarded by a mutex, WAL mode, schema embedded at compile
//! time. Each trait method locks the connection for a single synchronous
//! section and never across an `.await`.
//!
//! Investigation writes use `IMMEDIATE` transactions and a partial unique
//! index (`one ACTIVE row per pair`) so trigger placement and resolution stay
//! correct even when several processes share the database file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior, params};

use super::{
    ExclusionStore, InsertOutcome, InvestigationStore, PairHistoryStore, ResolveOutcome,
    StoreError,
};
use crate::anomaly::PairExclusion;
use crate::investigation::{Investigation, InvestigationStatus, Resolution};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

const INVESTIGATION_COLUMNS: &str = "id, pair_key, status, triggered_at_us, \
     triggering_anomaly_ids, breach_ids, correlation_score, resolved_at_us, resolution, \
     resolved_by, reason";

/// `SQLite` implementation of every store trait.
#[derive(Debug, Clone)]
pub struct SqliteWitnessStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteWitnessStore {
    /// Opens (or creates) a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!(path = %path.display(), "opened witness store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Returns the database path, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Timestamps are stored as microseconds since the epoch. Every `DateTime<Utc>`
// fits; sub-microsecond precision is dropped.
fn to_us(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_us(idx: usize, us: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, us))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_us(idx, row.get(idx)?)
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let us: Option<i64> = row.get(idx)?;
    us.map(|us| from_us(idx, us)).transpose()
}

fn count(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

fn encode_ids(ids: &[String]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

fn decode_ids(raw: &str, key: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        entity: "investigation",
        key: key.to_string(),
        details: format!("id list: {e}"),
    })
}

struct InvestigationRow {
    id: String,
    pair_key: String,
    status: String,
    triggered_at: DateTime<Utc>,
    triggering_anomaly_ids: String,
    breach_ids: String,
    correlation_score: f64,
    resolved_at: Option<DateTime<Utc>>,
    resolution: Option<String>,
    resolved_by: Option<String>,
    reason: Option<String>,
}

impl InvestigationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            pair_key: row.get(1)?,
            status: row.get(2)?,
            triggered_at: timestamp(row, 3)?,
            triggering_anomaly_ids: row.get(4)?,
            breach_ids: row.get(5)?,
            correlation_score: row.get(6)?,
            resolved_at: optional_timestamp(row, 7)?,
            resolution: row.get(8)?,
            resolved_by: row.get(9)?,
            reason: row.get(10)?,
        })
    }

    fn decode(self) -> Result<Investigation, StoreError> {
        let corrupt = |details: String| StoreError::Corrupt {
            entity: "investigation",
            key: self.id.clone(),
            details,
        };
        let status: InvestigationStatus = self.status.parse().map_err(corrupt)?;
        let resolution = match self.resolution.as_deref() {
            None => None,
            Some("CLEARED") => Some(Resolution::Cleared),
            Some("CONFIRMED") => Some(Resolution::Confirmed),
            Some(other) => return Err(corrupt(format!("unknown resolution {other}"))),
        };
        Ok(Investigation {
            triggering_anomaly_ids: decode_ids(&self.triggering_anomaly_ids, &self.id)?,
            breach_ids: decode_ids(&self.breach_ids, &self.id)?,
            id: self.id,
            pair_key: self.pair_key,
            status,
            triggered_at: self.triggered_at,
            correlation_score: self.correlation_score,
            resolved_at: self.resolved_at,
            resolution,
            resolved_by: self.resolved_by,
            reason: self.reason,
        })
    }
}

#[async_trait]
impl PairHistoryStore for SqliteWitnessStore {
    async fn upsert_pair(&self, pair_key: &str, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        let seen_us = to_us(seen_at);
        self.lock().execute(
            "INSERT INTO pair_history (pair_key, last_seen_us) VALUES (?1, ?2)
             ON CONFLICT(pair_key) DO UPDATE SET last_seen_us = excluded.last_seen_us",
            params![pair_key, seen_us],
        )?;
        Ok(())
    }

    async fn last_seen(&self, pair_key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let seen = self
            .lock()
            .query_row(
                "SELECT last_seen_us FROM pair_history WHERE pair_key = ?1",
                params![pair_key],
                |row| timestamp(row, 0),
            )
            .optional()?;
        Ok(seen)
    }

    async fn remove_seen_at_or_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff_us = to_us(cutoff);
        let removed = self.lock().execute(
            "DELETE FROM pair_history WHERE last_seen_us <= ?1",
            params![cutoff_us],
        )?;
        Ok(removed)
    }

    async fn pair_count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM pair_history", [], |row| row.get(0))?;
        Ok(count(n))
    }
}

fn exclusion_from_row(row: &Row<'_>) -> rusqlite::Result<PairExclusion> {
    Ok(PairExclusion {
        pair_key: row.get(0)?,
        excluded_at: timestamp(row, 1)?,
        excluded_until: timestamp(row, 2)?,
        reason: row.get(3)?,
        confidence: row.get(4)?,
    })
}

#[async_trait]
impl ExclusionStore for SqliteWitnessStore {
    async fn put_exclusion(&self, exclusion: PairExclusion) -> Result<(), StoreError> {
        let at_us = to_us(exclusion.excluded_at);
        let until_us = to_us(exclusion.excluded_until);
        self.lock().execute(
            "INSERT OR REPLACE INTO pair_exclusions
                 (pair_key, excluded_at_us, excluded_until_us, reason, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                exclusion.pair_key,
                at_us,
                until_us,
                exclusion.reason,
                exclusion.confidence
            ],
        )?;
        Ok(())
    }

    async fn get_exclusion(&self, pair_key: &str) -> Result<Option<PairExclusion>, StoreError> {
        Ok(self
            .lock()
            .query_row(
                "SELECT pair_key, excluded_at_us, excluded_until_us, reason, confidence
                 FROM pair_exclusions WHERE pair_key = ?1",
                params![pair_key],
                exclusion_from_row,
            )
            .optional()?)
    }

    async fn remove_exclusion(&self, pair_key: &str) -> Result<bool, StoreError> {
        let removed = self.lock().execute(
            "DELETE FROM pair_exclusions WHERE pair_key = ?1",
            params![pair_key],
        )?;
        Ok(removed > 0)
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let now_us = to_us(now);
        let removed = self.lock().execute(
            "DELETE FROM pair_exclusions WHERE excluded_until_us <= ?1",
            params![now_us],
        )?;
        Ok(removed)
    }

    async fn list_exclusions(&self) -> Result<Vec<PairExclusion>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT pair_key, excluded_at_us, excluded_until_us, reason, confidence
             FROM pair_exclusions ORDER BY pair_key",
        )?;
        let rows = stmt.query_map([], exclusion_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl InvestigationStore for SqliteWitnessStore {
    async fn insert_unless_active(
        &self,
        investigation: Investigation,
    ) -> Result<InsertOutcome, StoreError> {
        let triggered_us = to_us(investigation.triggered_at());
        let resolved_us = investigation.resolved_at().map(to_us);

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM investigations WHERE pair_key = ?1 AND status = 'ACTIVE'",
                params![investigation.pair_key()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(InsertOutcome::Existing(id));
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO investigations
                 (id, pair_key, status, triggered_at_us, triggering_anomaly_ids, breach_ids,
                  correlation_score, resolved_at_us, resolution, resolved_by, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                investigation.id(),
                investigation.pair_key(),
                investigation.status().as_str(),
                triggered_us,
                encode_ids(investigation.triggering_anomaly_ids()),
                encode_ids(investigation.breach_ids()),
                investigation.correlation_score(),
                resolved_us,
                investigation.resolution().map(|r| r.status().as_str()),
                investigation.resolved_by(),
                investigation.reason(),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict {
                entity: "investigation",
                key: investigation.id().to_string(),
            });
        }
        tx.commit()?;
        Ok(InsertOutcome::Created(investigation.id().to_string()))
    }

    async fn get(&self, id: &str) -> Result<Option<Investigation>, StoreError> {
        let row = self
            .lock()
            .query_row(
                &format!("SELECT {INVESTIGATION_COLUMNS} FROM investigations WHERE id = ?1"),
                params![id],
                InvestigationRow::from_row,
            )
            .optional()?;
        row.map(InvestigationRow::decode).transpose()
    }

    async fn active_for_pair(&self, pair_key: &str) -> Result<Option<Investigation>, StoreError> {
        let row = self
            .lock()
            .query_row(
                &format!(
                    "SELECT {INVESTIGATION_COLUMNS} FROM investigations
                     WHERE pair_key = ?1 AND status = 'ACTIVE'"
                ),
                params![pair_key],
                InvestigationRow::from_row,
            )
            .optional()?;
        row.map(InvestigationRow::decode).transpose()
    }

    async fn resolve_if_active(
        &self,
        resolved: &Investigation,
    ) -> Result<ResolveOutcome, StoreError> {
        let resolved_us = resolved.resolved_at().map(to_us);

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE investigations
             SET status = ?2, resolved_at_us = ?3, resolution = ?4, resolved_by = ?5, reason = ?6
             WHERE id = ?1 AND status = 'ACTIVE'",
            params![
                resolved.id(),
                resolved.status().as_str(),
                resolved_us,
                resolved.resolution().map(|r| r.status().as_str()),
                resolved.resolved_by(),
                resolved.reason(),
            ],
        )?;

        if updated == 0 {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM investigations WHERE id = ?1",
                    params![resolved.id()],
                    |row| row.get(0),
                )
                .optional()?;
            return match status {
                None => Ok(ResolveOutcome::NotFound),
                Some(raw) => {
                    let status = raw.parse().map_err(|details| StoreError::Corrupt {
                        entity: "investigation",
                        key: resolved.id().to_string(),
                        details,
                    })?;
                    Ok(ResolveOutcome::AlreadyResolved(status))
                },
            };
        }

        if resolved.resolution() == Some(Resolution::Confirmed) {
            tx.execute(
                "INSERT OR IGNORE INTO banned_pairs (pair_key, investigation_id, banned_at_us)
                 SELECT pair_key, id, ?2 FROM investigations WHERE id = ?1",
                params![resolved.id(), resolved_us.unwrap_or_default()],
            )?;
        }
        tx.commit()?;
        Ok(ResolveOutcome::Resolved)
    }

    async fn list_by_status(
        &self,
        status: InvestigationStatus,
    ) -> Result<Vec<Investigation>, StoreError> {
        let rows = {
            let conn = self.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {INVESTIGATION_COLUMNS} FROM investigations
                 WHERE status = ?1 ORDER BY triggered_at_us, id"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], InvestigationRow::from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        rows.into_iter().map(InvestigationRow::decode).collect()
    }

    async fn banned_pair_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT pair_key FROM banned_pairs")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<BTreeSet<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::store::MemoryWitnessStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn pair_history_roundtrip() {
        let store = SqliteWitnessStore::in_memory().unwrap();
        store.upsert_pair("W0:W1", t0()).await.unwrap();
        store
            .upsert_pair("W0:W1", t0() + Duration::minutes(5))
            .await
            .unwrap();
        store.upsert_pair("W0:W2", t0()).await.unwrap();

        assert_eq!(store.pair_count().await.unwrap(), 2);
        assert_eq!(
            store.last_seen("W0:W1").await.unwrap(),
            Some(t0() + Duration::minutes(5))
        );
        assert_eq!(store.remove_seen_at_or_before(t0()).await.unwrap(), 1);
        assert_eq!(store.pair_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn exclusion_roundtrip_and_expiry() {
        let store = SqliteWitnessStore::in_memory().unwrap();
        let exclusion =
            PairExclusion::new("W0:W1", t0(), Duration::hours(48), "co-occurrence", 0.92).unwrap();
        store.put_exclusion(exclusion.clone()).await.unwrap();

        assert_eq!(store.get_exclusion("W0:W1").await.unwrap(), Some(exclusion));
        assert_eq!(
            store
                .remove_expired(t0() + Duration::hours(47))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .remove_expired(t0() + Duration::hours(48))
                .await
                .unwrap(),
            1
        );
        assert!(!store.remove_exclusion("W0:W1").await.unwrap());
    }

    #[tokio::test]
    async fn far_future_exclusion_matches_memory_adapter() {
        let sqlite = SqliteWitnessStore::in_memory().unwrap();
        let memory = MemoryWitnessStore::new();
        let exclusion = PairExclusion::new(
            "a:b",
            t0(),
            Duration::hours(3_000_000),
            "excessive_pairing",
            0.9,
        )
        .unwrap();
        assert!(exclusion.excluded_until.timestamp_nanos_opt().is_none());

        sqlite.put_exclusion(exclusion.clone()).await.unwrap();
        memory.put_exclusion(exclusion.clone()).await.unwrap();
        assert_eq!(sqlite.get_exclusion("a:b").await.unwrap(), Some(exclusion.clone()));
        assert_eq!(
            sqlite.get_exclusion("a:b").await.unwrap(),
            memory.get_exclusion("a:b").await.unwrap()
        );
        assert_eq!(sqlite.remove_expired(t0() + Duration::days(365 * 300)).await.unwrap(), 0);
        assert_eq!(sqlite.remove_expired(exclusion.excluded_until).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sub_microsecond_precision_is_truncated() {
        let store = SqliteWitnessStore::in_memory().unwrap();
        let seen = t0() + Duration::nanoseconds(1_500);
        store.upsert_pair("W0:W1", seen).await.unwrap();
        assert_eq!(
            store.last_seen("W0:W1").await.unwrap(),
            Some(t0() + Duration::microseconds(1))
        );
    }

    #[tokio::test]
    async fn investigation_lifecycle_persists() {
        let store = SqliteWitnessStore::in_memory().unwrap();
        let inv = Investigation::open(
            "inv-1",
            "W0:W1",
            t0(),
            vec!["a1".to_string(), "a2".to_string()],
            vec!["b1".to_string()],
            0.85,
        );
        assert_eq!(
            store.insert_unless_active(inv.clone()).await.unwrap(),
            InsertOutcome::Created("inv-1".to_string())
        );
        assert_eq!(store.get("inv-1").await.unwrap(), Some(inv.clone()));

        let dup = Investigation::open("inv-2", "W0:W1", t0(), vec![], vec![], 0.9);
        assert_eq!(
            store.insert_unless_active(dup).await.unwrap(),
            InsertOutcome::Existing("inv-1".to_string())
        );

        let confirmed = inv
            .resolved(
                Resolution::Confirmed,
                "coordinated votes",
                "auditor",
                t0() + Duration::hours(3),
            )
            .unwrap();
        assert_eq!(
            store.resolve_if_active(&confirmed).await.unwrap(),
            ResolveOutcome::Resolved
        );
        assert_eq!(
            store.resolve_if_active(&confirmed).await.unwrap(),
            ResolveOutcome::AlreadyResolved(InvestigationStatus::Confirmed)
        );
        assert_eq!(store.get("inv-1").await.unwrap(), Some(confirmed));
        assert!(store.banned_pair_keys().await.unwrap().contains("W0:W1"));
        assert!(store.active_for_pair("W0:W1").await.unwrap().is_none());
        assert_eq!(
            store
                .list_by_status(InvestigationStatus::Confirmed)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
