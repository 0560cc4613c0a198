//! Pair rotation tracking.
//!
//! Each selected pair is stored as `canonical_key -> last_seen`. A pair is
//! inside the rotation window while `last_seen + window > now`; at exactly
//! `last_seen + window` it is outside again. Recording a pair again
//! refreshes its timestamp. Pruning only reclaims space: expired entries
//! already answer "not seen".

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::clock::Clock;
use crate::config::RotationPolicy;
use crate::store::{PairHistoryStore, StoreError};
use crate::types::WitnessPair;

/// Default rotation window in hours.
pub const ROTATION_WINDOW_HOURS: i64 = 24;

/// Tracks when witness pairs were last selected together.
pub struct PairHistoryTracker {
    store: Arc<dyn PairHistoryStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl std::fmt::Debug for PairHistoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairHistoryTracker")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl PairHistoryTracker {
    /// Creates a tracker with the default 24-hour window.
    #[must_use]
    pub fn new(store: Arc<dyn PairHistoryStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            window: Duration::hours(ROTATION_WINDOW_HOURS),
        }
    }

    /// Replaces the rotation window.
    #[must_use]
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Applies the configured rotation window.
    #[must_use]
    pub fn with_policy(self, policy: RotationPolicy) -> Self {
        self.with_window(policy.window())
    }

    /// Returns the rotation window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Returns true if `pair` was recorded within the rotation window.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn has_appeared_in_24h(&self, pair: &WitnessPair) -> Result<bool, StoreError> {
        self.has_appeared_in_window(&pair.canonical_key()).await
    }

    /// Same as [`Self::has_appeared_in_24h`], by canonical key.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn has_appeared_in_window(&self, pair_key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .store
            .last_seen(pair_key)
            .await?
            .is_some_and(|seen| self.inside_window(seen, now)))
    }

    /// Records that `pair` was selected now.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn record(&self, pair: &WitnessPair) -> Result<(), StoreError> {
        let key = pair.canonical_key();
        let now = self.clock.now();
        self.store.upsert_pair(&key, now).await?;
        debug!(pair_key = %key, at = %now, "pair recorded");
        Ok(())
    }

    /// Returns when the pair with `pair_key` was last recorded.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn last_appearance(&self, pair_key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.store.last_seen(pair_key).await
    }

    /// Deletes entries that have left the window. Returns the number
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn prune_expired(&self) -> Result<usize, StoreError> {
        let Some(cutoff) = self.clock.now().checked_sub_signed(self.window) else {
            return Ok(0);
        };
        let removed = self.store.remove_seen_at_or_before(cutoff).await?;
        if removed > 0 {
            debug!(removed, "pruned expired pair history");
        }
        Ok(removed)
    }

    /// Returns the number of tracked pairs, expired or not.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn count(&self) -> Result<usize, StoreError> {
        self.store.pair_count().await
    }

    fn inside_window(&self, seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        seen.checked_add_signed(self.window)
            .is_none_or(|until| until > now)
    }
}
