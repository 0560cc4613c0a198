//! The witness selector.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::error::SelectionError;
use super::record::SelectionRecord;
use super::seed::{SelectionSeed, seed_index};
use crate::clock::Clock;
use crate::config::SelectionPolicy;
use crate::events::{WitnessEvent, WitnessEventSink};
use crate::gate::ExclusionGate;
use crate::pair_history::PairHistoryTracker;
use crate::ports::{
    self, EntropySource, GENESIS_CHAIN_HASH, HaltChecker, HashChainReader, WitnessPool,
};
use crate::store::StoreError;
use crate::types::{WitnessId, WitnessPair, canonical_key};

/// Holder of the most recently selected witness.
///
/// The selector keeps this in memory by default. Deployments running several
/// selectors against one ledger inject a shared implementation so they all
/// see the same previous witness.
#[async_trait]
pub trait PreviousWitnessStore: Send + Sync {
    /// Returns the previously selected witness, if any.
    async fn previous(&self) -> Result<Option<WitnessId>, StoreError>;

    /// Replaces the previously selected witness.
    async fn set_previous(&self, witness: &WitnessId) -> Result<(), StoreError>;
}

/// In-process previous-witness pointer.
#[derive(Debug, Default)]
pub struct MemoryPreviousWitness {
    witness: Mutex<Option<WitnessId>>,
}

impl MemoryPreviousWitness {
    /// Creates an empty pointer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pointer already set to `witness`.
    #[must_use]
    pub const fn starting_at(witness: WitnessId) -> Self {
        Self {
            witness: Mutex::new(Some(witness)),
        }
    }

    /// Forgets the previous witness.
    pub fn clear(&self) {
        *self.witness.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl PreviousWitnessStore for MemoryPreviousWitness {
    async fn previous(&self) -> Result<Option<WitnessId>, StoreError> {
        Ok(self
            .witness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn set_previous(&self, witness: &WitnessId) -> Result<(), StoreError> {
        *self.witness.lock().unwrap_or_else(PoisonError::into_inner) = Some(witness.clone());
        Ok(())
    }
}

/// Selects witnesses verifiably and enforces pair rotation.
///
/// `select` gives no mutual exclusion between concurrent calls: two calls
/// may race on the previous-witness pointer. Callers that need one
/// selection at a time serialize externally.
pub struct WitnessSelector {
    entropy: Arc<dyn EntropySource>,
    chain: Arc<dyn HashChainReader>,
    pool: Arc<dyn WitnessPool>,
    halt: Arc<dyn HaltChecker>,
    history: Arc<PairHistoryTracker>,
    gate: Arc<dyn ExclusionGate>,
    previous: Arc<dyn PreviousWitnessStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn WitnessEventSink>,
    policy: SelectionPolicy,
}

impl std::fmt::Debug for WitnessSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WitnessSelector")
            .field("entropy", &self.entropy.source_identifier())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl WitnessSelector {
    /// Creates a selector with an in-memory previous-witness pointer and the
    /// default pool minimums.
    #[expect(
        clippy::too_many_arguments,
        reason = "every collaborator is an injected port"
    )]
    #[must_use]
    pub fn new(
        entropy: Arc<dyn EntropySource>,
        chain: Arc<dyn HashChainReader>,
        pool: Arc<dyn WitnessPool>,
        halt: Arc<dyn HaltChecker>,
        history: Arc<PairHistoryTracker>,
        gate: Arc<dyn ExclusionGate>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn WitnessEventSink>,
    ) -> Self {
        Self {
            entropy,
            chain,
            pool,
            halt,
            history,
            gate,
            previous: Arc::new(MemoryPreviousWitness::new()),
            clock,
            events,
            policy: SelectionPolicy::default(),
        }
    }

    /// Uses `previous` as the previous-witness pointer.
    #[must_use]
    pub fn with_previous_store(mut self, previous: Arc<dyn PreviousWitnessStore>) -> Self {
        self.previous = previous;
        self
    }

    /// Replaces the pool minimums.
    #[must_use]
    pub const fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the previously selected witness.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn previous_witness(&self) -> Result<Option<WitnessId>, StoreError> {
        self.previous.previous().await
    }

    /// Selects a witness.
    ///
    /// The candidate is `pool[u64_be(seed[0..8]) mod pool_size]` over the
    /// sorted pool. When a previous witness is known and the candidate pair
    /// was used within the rotation window, is excluded, or is the previous
    /// witness itself, the next candidate comes from
    /// `SHA-256(combined_seed || u32_be(attempt))` for attempts
    /// `1..pool_size`.
    ///
    /// Recording the pair and moving the previous-witness pointer happen
    /// last, after the record has verified.
    ///
    /// # Errors
    ///
    /// - [`SelectionError::Halted`] before any collaborator is called.
    /// - [`SelectionError::EntropyUnavailable`] if the entropy source fails.
    /// - [`SelectionError::InsufficientPool`] if the pool is below the
    ///   minimum for the operation class.
    /// - [`SelectionError::PairsExhausted`] if every candidate is blocked.
    pub async fn select(&self, high_stakes: bool) -> Result<SelectionRecord, SelectionError> {
        if let Some(reason) = ports::halted(self.halt.as_ref()).await {
            warn!(%reason, "selection rejected: system halted");
            return Err(SelectionError::Halted { reason });
        }

        let source_id = self.entropy.source_identifier();
        let entropy = self.entropy.get_entropy().await.map_err(|e| {
            warn!(source_id = %source_id, error = %e, "entropy unavailable");
            SelectionError::EntropyUnavailable {
                source_id: source_id.clone(),
                message: e.message,
            }
        })?;

        let chain_hash = self
            .chain
            .latest_content_hash()
            .await
            .map_err(SelectionError::ChainUnavailable)?
            .unwrap_or_else(|| GENESIS_CHAIN_HASH.to_string());
        let seed = SelectionSeed::compute(entropy, chain_hash);

        let pool = ports::sorted_snapshot(self.pool.as_ref())
            .await
            .map_err(SelectionError::PoolUnavailable)?;
        let required = self.policy.required(high_stakes);
        if pool.is_empty() || pool.len() < required {
            warn!(
                available = pool.len(),
                required, high_stakes, "insufficient witness pool"
            );
            return Err(SelectionError::InsufficientPool {
                available: pool.len(),
                required,
            });
        }

        let previous = self.previous.previous().await?;
        let (attempt, selected) = self.choose(&seed, &pool, previous.as_ref()).await?;

        let record = SelectionRecord::new(
            seed,
            source_id,
            selected,
            pool,
            self.clock.now(),
            attempt,
        );
        record.verify()?;

        if let Some(previous) = &previous {
            self.history
                .record(&WitnessPair::new(
                    previous.clone(),
                    record.selected_witness_id().clone(),
                ))
                .await?;
        }
        self.previous
            .set_previous(record.selected_witness_id())
            .await?;

        info!(
            witness = %record.selected_witness_id(),
            retry_attempt = attempt,
            pool_size = record.pool_snapshot().len(),
            high_stakes,
            "witness selected"
        );
        self.events.emit(WitnessEvent::SelectionMade {
            witness_id: record.selected_witness_id().clone(),
            seed_source: record.seed_source().to_string(),
            combined_seed: hex::encode(record.seed().combined_seed()),
            retry_attempt: attempt,
            pool_size: record.pool_snapshot().len() as u64,
            selected_at: record.selected_at(),
        });
        Ok(record)
    }

    async fn choose(
        &self,
        seed: &SelectionSeed,
        pool: &[WitnessId],
        previous: Option<&WitnessId>,
    ) -> Result<(u32, WitnessId), SelectionError> {
        let pool_size = pool.len();
        let attempts = u32::try_from(pool_size).unwrap_or(u32::MAX);

        for attempt in 0..attempts {
            let index = seed_index(&seed.effective_seed(attempt), pool_size).ok_or(
                SelectionError::InsufficientPool {
                    available: 0,
                    required: self.policy.standard_minimum,
                },
            )?;
            let candidate = &pool[index];

            let Some(previous) = previous else {
                return Ok((attempt, candidate.clone()));
            };
            if candidate == previous {
                debug!(attempt, candidate = %candidate, "candidate is the previous witness");
                continue;
            }
            let key = canonical_key(previous, candidate);
            if self.history.has_appeared_in_window(&key).await? {
                debug!(attempt, pair_key = %key, "pair used within rotation window");
                continue;
            }
            if self.gate.is_pair_blocked(&key).await? {
                debug!(attempt, pair_key = %key, "pair excluded");
                continue;
            }
            return Ok((attempt, candidate.clone()));
        }

        warn!(pool_size, attempts, "all candidate pairs exhausted");
        Err(SelectionError::PairsExhausted {
            pool_size,
            attempts,
        })
    }
}
