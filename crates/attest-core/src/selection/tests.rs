//! Tests for the witness selector.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sha2::{Digest, Sha256};

use super::*;
use crate::clock::ManualClock;
use crate::events::{MemoryEventSink, WitnessEvent};
use crate::gate::ExclusionGate;
use crate::pair_history::PairHistoryTracker;
use crate::ports::{FixedEntropySource, HaltFlag, MemoryHashChain, StaticWitnessPool};
use crate::store::{MemoryWitnessStore, StoreError};
use crate::types::{WitnessId, WitnessPair};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
}

fn id(s: &str) -> WitnessId {
    WitnessId::new(s).unwrap()
}

fn witnesses(n: usize) -> Vec<WitnessId> {
    (0..n).map(|i| id(&format!("W{i}"))).collect()
}

fn sorted(mut ids: Vec<WitnessId>) -> Vec<WitnessId> {
    ids.sort();
    ids
}

#[derive(Default)]
struct BlockList {
    keys: Mutex<BTreeSet<String>>,
}

impl BlockList {
    fn block(&self, key: &str) {
        self.keys.lock().unwrap().insert(key.to_string());
    }
}

#[async_trait]
impl ExclusionGate for BlockList {
    async fn is_pair_blocked(&self, pair_key: &str) -> Result<bool, StoreError> {
        Ok(self.keys.lock().unwrap().contains(pair_key))
    }
}

struct Harness {
    selector: WitnessSelector,
    entropy: Arc<FixedEntropySource>,
    halt: Arc<HaltFlag>,
    clock: Arc<ManualClock>,
    history: Arc<PairHistoryTracker>,
    previous: Arc<MemoryPreviousWitness>,
    blocked: Arc<BlockList>,
    events: Arc<MemoryEventSink>,
}

fn harness(pool: Vec<WitnessId>, entropy: Vec<u8>) -> Harness {
    let entropy = Arc::new(FixedEntropySource::new(entropy, "fixed-test"));
    let halt = Arc::new(HaltFlag::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let history = Arc::new(PairHistoryTracker::new(
        Arc::new(MemoryWitnessStore::new()),
        clock.clone(),
    ));
    let previous = Arc::new(MemoryPreviousWitness::new());
    let blocked = Arc::new(BlockList::default());
    let events = Arc::new(MemoryEventSink::new());

    let selector = WitnessSelector::new(
        entropy.clone(),
        Arc::new(MemoryHashChain::new()),
        Arc::new(StaticWitnessPool::new(pool)),
        halt.clone(),
        history.clone(),
        blocked.clone(),
        clock.clone(),
        events.clone(),
    )
    .with_previous_store(previous.clone());

    Harness {
        selector,
        entropy,
        halt,
        clock,
        history,
        previous,
        blocked,
        events,
    }
}

/// Finds 4-byte entropy whose genesis seed satisfies `accept`.
fn find_entropy(accept: impl Fn(&SelectionSeed) -> bool) -> Vec<u8> {
    (0u32..100_000)
        .map(|k| k.to_be_bytes().to_vec())
        .find(|entropy| accept(&SelectionSeed::compute(entropy.clone(), "genesis")))
        .expect("no entropy satisfies the predicate")
}

fn pick<'a>(seed: &SelectionSeed, attempt: u32, pool: &'a [WitnessId]) -> &'a WitnessId {
    expected_witness(&seed.effective_seed(attempt), pool).unwrap()
}

// =============================================================================
// First selection
// =============================================================================

#[tokio::test]
async fn genesis_selection_matches_direct_hash() {
    let h = harness(witnesses(15), vec![0u8; 32]);
    let record = h.selector.select(false).await.unwrap();

    let mut input = vec![0u8; 32];
    input.extend_from_slice(b"genesis");
    let digest = Sha256::digest(&input);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let index = usize::try_from(u64::from_be_bytes(prefix) % 15).unwrap();
    let pool = sorted(witnesses(15));

    assert_eq!(record.selected_witness_id(), &pool[index]);
    assert_eq!(record.pool_snapshot(), pool.as_slice());
    assert_eq!(record.retry_attempt(), 0);
    assert_eq!(record.seed().chain_hash(), "genesis");
    assert_eq!(record.seed_source(), "fixed-test");
    assert_eq!(record.algorithm_version(), ALGORITHM_VERSION);
    assert_eq!(record.selected_at(), t0());
    record.verify().unwrap();
}

#[tokio::test]
async fn first_selection_sets_previous_without_recording_a_pair() {
    let h = harness(witnesses(8), vec![9; 32]);
    let record = h.selector.select(false).await.unwrap();

    assert_eq!(
        h.selector.previous_witness().await.unwrap().as_ref(),
        Some(record.selected_witness_id())
    );
    assert_eq!(h.history.count().await.unwrap(), 0);

    let events = h.events.of_type("SELECTION_MADE");
    assert_eq!(events.len(), 1);
    match &events[0] {
        WitnessEvent::SelectionMade {
            witness_id,
            combined_seed,
            retry_attempt,
            pool_size,
            ..
        } => {
            assert_eq!(witness_id, record.selected_witness_id());
            assert_eq!(combined_seed, &hex::encode(record.seed().combined_seed()));
            assert_eq!(*retry_attempt, 0);
            assert_eq!(*pool_size, 8);
        },
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn second_selection_records_the_pair() {
    let h = harness(witnesses(10), vec![1; 32]);
    let first = h.selector.select(false).await.unwrap();
    h.entropy.set_bytes(vec![2; 32]);
    let second = h.selector.select(false).await.unwrap();

    assert_ne!(first.selected_witness_id(), second.selected_witness_id());
    let pair = WitnessPair::new(
        first.selected_witness_id().clone(),
        second.selected_witness_id().clone(),
    );
    assert!(h.history.has_appeared_in_24h(&pair).await.unwrap());
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn halt_rejects_before_entropy_is_read() {
    let h = harness(witnesses(15), vec![0; 32]);
    h.entropy.set_failing(true);
    h.halt.halt("audit in progress");

    let err = h.selector.select(false).await.unwrap_err();
    assert!(matches!(err, SelectionError::Halted { ref reason } if reason == "audit in progress"));
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn entropy_failure_has_no_fallback() {
    let h = harness(witnesses(15), vec![0; 32]);
    h.entropy.set_failing(true);

    let err = h.selector.select(false).await.unwrap_err();
    assert!(
        matches!(err, SelectionError::EntropyUnavailable { ref source_id, .. } if source_id == "fixed-test")
    );
    assert_eq!(h.selector.previous_witness().await.unwrap(), None);
}

#[tokio::test]
async fn pool_minimums_depend_on_operation_class() {
    let h = harness(witnesses(5), vec![0; 32]);
    let err = h.selector.select(false).await.unwrap_err();
    assert!(matches!(
        err,
        SelectionError::InsufficientPool {
            available: 5,
            required: 6
        }
    ));

    let h = harness(witnesses(11), vec![0; 32]);
    h.selector.select(false).await.unwrap();
    let err = h.selector.select(true).await.unwrap_err();
    assert!(matches!(
        err,
        SelectionError::InsufficientPool {
            available: 11,
            required: 12
        }
    ));

    let h = harness(witnesses(12), vec![0; 32]);
    h.selector.select(true).await.unwrap();
}

#[tokio::test]
async fn duplicate_pool_entries_do_not_count() {
    let mut pool = witnesses(5);
    pool.push(id("W0"));
    let h = harness(pool, vec![0; 32]);
    let err = h.selector.select(false).await.unwrap_err();
    assert!(matches!(
        err,
        SelectionError::InsufficientPool { available: 5, .. }
    ));
}

// =============================================================================
// Rotation
// =============================================================================

#[tokio::test]
async fn recent_pair_forces_first_retry() {
    let pool = sorted(witnesses(15));
    let (w0, w1) = (id("W0"), id("W1"));
    let entropy = find_entropy(|seed| {
        let first = pick(seed, 0, &pool);
        let retry = pick(seed, 1, &pool);
        *first == w1 && *retry != w0 && *retry != w1
    });
    let expected_retry = pick(&SelectionSeed::compute(entropy.clone(), "genesis"), 1, &pool).clone();

    let h = harness(witnesses(15), entropy);
    h.history
        .record(&WitnessPair::new(w0.clone(), w1.clone()))
        .await
        .unwrap();
    h.previous.set_previous(&w0).await.unwrap();

    h.clock.advance(Duration::hours(1));
    let record = h.selector.select(false).await.unwrap();
    assert_eq!(record.retry_attempt(), 1);
    assert_eq!(record.selected_witness_id(), &expected_retry);
    record.verify().unwrap();

    // Once the window has passed, the same inputs pick W1 directly.
    h.clock.set(t0() + Duration::hours(24));
    h.previous.set_previous(&w0).await.unwrap();
    let record = h.selector.select(false).await.unwrap();
    assert_eq!(record.retry_attempt(), 0);
    assert_eq!(record.selected_witness_id(), &w1);
}

#[tokio::test]
async fn previous_witness_is_never_reselected() {
    let pool = sorted(witnesses(6));
    let seed = SelectionSeed::compute(vec![5; 32], "genesis");
    let first = pick(&seed, 0, &pool).clone();

    let h = harness(witnesses(6), vec![5; 32]);
    h.previous.set_previous(&first).await.unwrap();
    let record = h.selector.select(false).await.unwrap();

    assert_ne!(record.selected_witness_id(), &first);
    assert!(record.retry_attempt() >= 1);
    record.verify().unwrap();
}

#[tokio::test]
async fn excluded_pair_is_skipped() {
    let pool = sorted(witnesses(15));
    let (w0, w1) = (id("W0"), id("W1"));
    let entropy = find_entropy(|seed| *pick(seed, 0, &pool) == w1);

    let h = harness(witnesses(15), entropy);
    h.previous.set_previous(&w0).await.unwrap();
    h.blocked.block("W0:W1");

    let record = h.selector.select(false).await.unwrap();
    assert_ne!(record.selected_witness_id(), &w1);
    assert_ne!(record.selected_witness_id(), &w0);
    assert!(record.retry_attempt() >= 1);
}

#[tokio::test]
async fn exhausted_candidates_leave_state_untouched() {
    let h = harness(witnesses(6), vec![3; 32]);
    let w0 = id("W0");
    h.previous.set_previous(&w0).await.unwrap();
    for other in witnesses(6).iter().skip(1) {
        h.blocked.block(&format!("W0:{other}"));
    }

    let err = h.selector.select(false).await.unwrap_err();
    assert!(matches!(
        err,
        SelectionError::PairsExhausted {
            pool_size: 6,
            attempts: 6
        }
    ));
    assert_eq!(h.selector.previous_witness().await.unwrap(), Some(w0));
    assert_eq!(h.history.count().await.unwrap(), 0);
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn chain_head_changes_the_seed() {
    let h = harness(witnesses(15), vec![0; 32]);
    let genesis = h.selector.select(false).await.unwrap();
    h.previous.clear();

    let chain = Arc::new(MemoryHashChain::with_head("ab".repeat(32)));
    let selector = WitnessSelector::new(
        h.entropy.clone(),
        chain,
        Arc::new(StaticWitnessPool::new(witnesses(15))),
        h.halt.clone(),
        h.history.clone(),
        h.blocked.clone(),
        h.clock.clone(),
        h.events.clone(),
    );
    let headed = selector.select(false).await.unwrap();

    assert_eq!(headed.seed().chain_hash(), "ab".repeat(32));
    assert_ne!(
        genesis.seed().combined_seed(),
        headed.seed().combined_seed()
    );
}
