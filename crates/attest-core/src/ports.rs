//! Capabilities the core consumes from the surrounding system.
//!
//! Entropy, ledger hash-chain state, halt status and the active witness set
//! are owned elsewhere. The core only sees them through the traits in this
//! module, each of which ships with one in-process adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::types::WitnessId;

/// Sentinel chain hash used when the ledger has no entries yet.
pub const GENESIS_CHAIN_HASH: &str = "genesis";

/// Number of bytes [`OsEntropySource`] returns per call.
pub const OS_ENTROPY_BYTES: usize = 32;

/// Failure reported by an external collaborator.
///
/// The core never inspects the message; it only records which collaborator
/// failed and surfaces the failure unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{collaborator} failed: {message}")]
pub struct CollaboratorError {
    /// Name of the failing collaborator.
    pub collaborator: &'static str,
    /// Description of the failure.
    pub message: String,
}

impl CollaboratorError {
    /// Creates a collaborator error.
    #[must_use]
    pub fn new(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self {
            collaborator,
            message: message.into(),
        }
    }
}

// =============================================================================
// Entropy
// =============================================================================

/// Supplier of unpredictable bytes.
#[async_trait]
pub trait EntropySource: Send + Sync {
    /// Returns fresh entropy. Timeouts must be surfaced as errors.
    async fn get_entropy(&self) -> Result<Vec<u8>, CollaboratorError>;

    /// Returns a human-readable identifier of this source.
    fn source_identifier(&self) -> String;
}

/// Entropy from the operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropySource;

#[async_trait]
impl EntropySource for OsEntropySource {
    async fn get_entropy(&self) -> Result<Vec<u8>, CollaboratorError> {
        let mut bytes = vec![0u8; OS_ENTROPY_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CollaboratorError::new("entropy source", e.to_string()))?;
        Ok(bytes)
    }

    fn source_identifier(&self) -> String {
        "os-csprng".to_string()
    }
}

/// Entropy source returning a fixed byte string, for replay and tests.
#[derive(Debug)]
pub struct FixedEntropySource {
    bytes: RwLock<Vec<u8>>,
    identifier: String,
    failing: AtomicBool,
}

impl FixedEntropySource {
    /// Creates a source that always yields `bytes`.
    #[must_use]
    pub fn new(bytes: Vec<u8>, identifier: impl Into<String>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
            identifier: identifier.into(),
            failing: AtomicBool::new(false),
        }
    }

    /// Replaces the bytes returned by subsequent calls.
    pub fn set_bytes(&self, bytes: Vec<u8>) {
        *self.bytes.write().unwrap_or_else(PoisonError::into_inner) = bytes;
    }

    /// Makes subsequent calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EntropySource for FixedEntropySource {
    async fn get_entropy(&self) -> Result<Vec<u8>, CollaboratorError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::new(
                "entropy source",
                format!("{} unavailable", self.identifier),
            ));
        }
        Ok(self
            .bytes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn source_identifier(&self) -> String {
        self.identifier.clone()
    }
}

// =============================================================================
// Hash chain
// =============================================================================

/// Reader for the governance ledger's hash chain.
#[async_trait]
pub trait HashChainReader: Send + Sync {
    /// Returns the content hash of the latest ledger entry, or `None` when
    /// the ledger is empty.
    async fn latest_content_hash(&self) -> Result<Option<String>, CollaboratorError>;
}

/// In-memory chain head.
#[derive(Debug, Default)]
pub struct MemoryHashChain {
    head: RwLock<Option<String>>,
}

impl MemoryHashChain {
    /// Creates an empty chain (reads as genesis).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a chain whose head is `hash`.
    #[must_use]
    pub fn with_head(hash: impl Into<String>) -> Self {
        Self {
            head: RwLock::new(Some(hash.into())),
        }
    }

    /// Advances the chain head.
    pub fn set_head(&self, hash: impl Into<String>) {
        *self.head.write().unwrap_or_else(PoisonError::into_inner) = Some(hash.into());
    }
}

#[async_trait]
impl HashChainReader for MemoryHashChain {
    async fn latest_content_hash(&self) -> Result<Option<String>, CollaboratorError> {
        Ok(self
            .head
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

// =============================================================================
// Halt
// =============================================================================

/// Reports whether the governance system is halted.
#[async_trait]
pub trait HaltChecker: Send + Sync {
    /// Returns true while the system is halted.
    async fn is_halted(&self) -> bool;

    /// Returns the reason for the current halt, if any.
    async fn halt_reason(&self) -> Option<String>;
}

/// In-process halt switch.
#[derive(Debug, Default)]
pub struct HaltFlag {
    reason: Mutex<Option<String>>,
}

impl HaltFlag {
    /// Creates a flag in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Halts with `reason`.
    pub fn halt(&self, reason: impl Into<String>) {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    /// Clears the halt.
    pub fn resume(&self) {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl HaltChecker for HaltFlag {
    async fn is_halted(&self) -> bool {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn halt_reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Returns the halt reason when `checker` reports a halt.
///
/// Components call this first in every mutating operation.
pub(crate) async fn halted(checker: &dyn HaltChecker) -> Option<String> {
    if checker.is_halted().await {
        Some(
            checker
                .halt_reason()
                .await
                .unwrap_or_else(|| "unspecified".to_string()),
        )
    } else {
        None
    }
}

// =============================================================================
// Witness pool
// =============================================================================

/// Source of the currently active (non-retired) witnesses.
#[async_trait]
pub trait WitnessPool: Send + Sync {
    /// Returns the active witnesses in any order.
    async fn active_witnesses(&self) -> Result<Vec<WitnessId>, CollaboratorError>;
}

/// In-memory witness registry.
#[derive(Debug, Default)]
pub struct StaticWitnessPool {
    witnesses: RwLock<Vec<WitnessId>>,
}

impl StaticWitnessPool {
    /// Creates a pool containing `witnesses`.
    #[must_use]
    pub const fn new(witnesses: Vec<WitnessId>) -> Self {
        Self {
            witnesses: RwLock::new(witnesses),
        }
    }

    /// Adds a witness if not already present.
    pub fn add(&self, witness: WitnessId) {
        let mut witnesses = self.witnesses.write().unwrap_or_else(PoisonError::into_inner);
        if !witnesses.contains(&witness) {
            witnesses.push(witness);
        }
    }

    /// Removes a witness. Returns true if it was present.
    pub fn remove(&self, witness: &WitnessId) -> bool {
        let mut witnesses = self.witnesses.write().unwrap_or_else(PoisonError::into_inner);
        let before = witnesses.len();
        witnesses.retain(|w| w != witness);
        witnesses.len() != before
    }
}

#[async_trait]
impl WitnessPool for StaticWitnessPool {
    async fn active_witnesses(&self) -> Result<Vec<WitnessId>, CollaboratorError> {
        Ok(self
            .witnesses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Fetches the pool and returns it sorted lexicographically without
/// duplicates.
pub(crate) async fn sorted_snapshot(
    pool: &dyn WitnessPool,
) -> Result<Vec<WitnessId>, CollaboratorError> {
    let mut witnesses = pool.active_witnesses().await?;
    witnesses.sort();
    witnesses.dedup();
    Ok(witnesses)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(id: &str) -> WitnessId {
        WitnessId::new(id).unwrap()
    }

    #[tokio::test]
    async fn os_entropy_returns_requested_length() {
        let bytes = OsEntropySource.get_entropy().await.unwrap();
        assert_eq!(bytes.len(), OS_ENTROPY_BYTES);
    }

    #[tokio::test]
    async fn fixed_entropy_can_fail() {
        let source = FixedEntropySource::new(vec![7; 4], "fixed");
        assert_eq!(source.get_entropy().await.unwrap(), vec![7; 4]);

        source.set_failing(true);
        let err = source.get_entropy().await.unwrap_err();
        assert_eq!(err.collaborator, "entropy source");
    }

    #[tokio::test]
    async fn empty_chain_reads_as_none() {
        let chain = MemoryHashChain::new();
        assert_eq!(chain.latest_content_hash().await.unwrap(), None);
        chain.set_head("abc");
        assert_eq!(
            chain.latest_content_hash().await.unwrap(),
            Some("abc".to_string())
        );
    }

    #[tokio::test]
    async fn halt_flag_reports_reason() {
        let flag = HaltFlag::new();
        assert_eq!(halted(&flag).await, None);

        flag.halt("constitutional crisis");
        assert_eq!(
            halted(&flag).await,
            Some("constitutional crisis".to_string())
        );

        flag.resume();
        assert!(!flag.is_halted().await);
    }

    #[tokio::test]
    async fn snapshot_is_sorted_and_deduplicated() {
        let pool = StaticWitnessPool::new(vec![w("c"), w("a"), w("b")]);
        pool.add(w("a"));
        pool.add(w("d"));
        assert!(pool.remove(&w("d")));

        let snapshot = sorted_snapshot(&pool).await.unwrap();
        assert_eq!(snapshot, vec![w("a"), w("b"), w("c")]);
    }
}
