//! Property tests for the nonce ledger
//!
//! Arbitrary operation sequences must never hand out a nonce twice, never
//! let the used and pending sets overlap, and never move the current nonce
//! backwards except through a sync.

use proptest::prelude::*;
use signguard::nonce_ledger::{LedgerError, NonceLedger};
use signguard::types::{Address, ChainId, Nonce};
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};

const CHAIN: ChainId = ChainId(1);

fn account() -> Address {
    Address::from_bytes([7; 20])
}

#[derive(Debug, Clone)]
enum Op {
    ReserveNext,
    Reserve(Nonce),
    Release(Nonce),
    Confirm(Nonce),
    Consume(Nonce),
    Sync(Nonce),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::ReserveNext),
        2 => (0u64..24).prop_map(Op::Reserve),
        2 => (0u64..24).prop_map(Op::Release),
        2 => (0u64..24).prop_map(Op::Confirm),
        1 => (0u64..24).prop_map(Op::Consume),
        1 => (0u64..24).prop_map(Op::Sync),
    ]
}

fn check_invariants(ledger: &NonceLedger) -> Result<(), TestCaseError> {
    let record = ledger.snapshot(account(), CHAIN);
    prop_assert!(record.used_nonces().is_disjoint(record.pending_nonces()));
    if let Some(max_used) = record.used_nonces().iter().next_back() {
        prop_assert!(record.current_nonce() > *max_used);
    }
    Ok(())
}

proptest! {
    #[test]
    fn ledger_invariants_hold_for_any_sequence(ops in prop::collection::vec(op(), 1..64)) {
        let ledger = NonceLedger::new();
        let a = account();

        for op in ops {
            let before = ledger.current_nonce(a, CHAIN);
            let mut synced = false;
            match op {
                Op::ReserveNext => {
                    let next = ledger.next_nonce(a, CHAIN);
                    prop_assert!(!ledger.used_nonces(a, CHAIN).contains(&next));
                    prop_assert!(!ledger.pending_nonces(a, CHAIN).contains(&next));
                    ledger.reserve(a, CHAIN, next).unwrap();
                }
                Op::Reserve(n) => {
                    let pending = ledger.pending_nonces(a, CHAIN);
                    let used = ledger.used_nonces(a, CHAIN);
                    match ledger.reserve(a, CHAIN, n) {
                        Ok(()) => {
                            prop_assert!(!pending.contains(&n));
                            prop_assert!(!used.contains(&n));
                            prop_assert!(n >= before);
                        }
                        Err(LedgerError::AlreadyUsed { .. }) => prop_assert!(used.contains(&n)),
                        Err(LedgerError::AlreadyPending { .. }) => prop_assert!(pending.contains(&n)),
                        Err(LedgerError::TooLow { .. }) => prop_assert!(n < before),
                        Err(other) => prop_assert!(false, "unexpected error {other}"),
                    }
                }
                Op::Release(n) => {
                    ledger.release(a, CHAIN, n);
                    prop_assert!(!ledger.pending_nonces(a, CHAIN).contains(&n));
                }
                Op::Confirm(n) => {
                    ledger.confirm(a, CHAIN, n);
                    prop_assert!(ledger.used_nonces(a, CHAIN).contains(&n));
                    prop_assert!(ledger.current_nonce(a, CHAIN) > n);
                }
                Op::Consume(n) => {
                    let _ = ledger.validate_and_consume(a, CHAIN, n);
                }
                Op::Sync(truth) => {
                    let current = ledger.sync(a, CHAIN, truth);
                    prop_assert!(current >= truth);
                    synced = true;
                }
            }
            if !synced {
                prop_assert!(ledger.current_nonce(a, CHAIN) >= before);
            }
            check_invariants(&ledger)?;
        }
    }

    #[test]
    fn reserve_next_never_repeats_without_release(count in 1usize..40, confirms in prop::collection::vec(0u64..40, 0..10)) {
        let ledger = NonceLedger::new();
        let a = account();
        for n in &confirms {
            ledger.confirm(a, CHAIN, *n);
        }

        let mut handed_out = BTreeSet::new();
        for _ in 0..count {
            let next = ledger.next_nonce(a, CHAIN);
            ledger.reserve(a, CHAIN, next).unwrap();
            prop_assert!(handed_out.insert(next), "nonce {} handed out twice", next);
            prop_assert!(!confirms.contains(&next));
        }
    }

    #[test]
    fn consume_rejects_low_and_used(confirms in prop::collection::vec(0u64..30, 1..10), candidate in 0u64..40) {
        let ledger = NonceLedger::new();
        let a = account();
        for n in &confirms {
            ledger.confirm(a, CHAIN, *n);
        }
        let current = ledger.current_nonce(a, CHAIN);
        let used = ledger.used_nonces(a, CHAIN);

        match ledger.validate_and_consume(a, CHAIN, candidate) {
            Err(LedgerError::TooLow { .. }) => prop_assert!(candidate < current),
            Err(LedgerError::AlreadyUsed { .. }) => prop_assert!(used.contains(&candidate)),
            Err(other) => prop_assert!(false, "unexpected error {other}"),
            Ok(()) => {
                prop_assert!(candidate >= current);
                prop_assert!(!used.contains(&candidate));
            }
        }
        if candidate < current {
            prop_assert!(ledger.validate_and_consume(a, CHAIN, candidate).is_err());
        }
    }

    #[test]
    fn release_is_idempotent(reserved in prop::collection::btree_set(0u64..20, 0..8), target in 0u64..20) {
        let ledger = NonceLedger::new();
        let a = account();
        for n in &reserved {
            ledger.reserve(a, CHAIN, *n).unwrap();
        }
        ledger.release(a, CHAIN, target);
        let once = ledger.snapshot(a, CHAIN);
        ledger.release(a, CHAIN, target);
        let twice = ledger.snapshot(a, CHAIN);
        prop_assert_eq!(once.pending_nonces(), twice.pending_nonces());
        prop_assert_eq!(once.used_nonces(), twice.used_nonces());
        prop_assert_eq!(once.current_nonce(), twice.current_nonce());
    }

    #[test]
    fn release_makes_nonce_reusable(pre in 0usize..10) {
        let ledger = NonceLedger::new();
        let a = account();
        for _ in 0..pre {
            let n = ledger.next_nonce(a, CHAIN);
            ledger.reserve(a, CHAIN, n).unwrap();
            ledger.confirm(a, CHAIN, n);
        }
        let n = ledger.next_nonce(a, CHAIN);
        ledger.reserve(a, CHAIN, n).unwrap();
        ledger.release(a, CHAIN, n);
        prop_assert_eq!(ledger.next_nonce(a, CHAIN), n);
    }
}

#[test]
fn scenario_double_reserve_is_already_pending() {
    let ledger = NonceLedger::new();
    let a = account();
    assert_eq!(ledger.next_nonce(a, CHAIN), 0);
    ledger.reserve(a, CHAIN, 0).unwrap();
    assert_eq!(
        ledger.reserve(a, CHAIN, 0),
        Err(LedgerError::AlreadyPending { nonce: 0 })
    );
}

#[test]
fn scenario_reserve_confirm_release() {
    let ledger = NonceLedger::new();
    let a = account();
    ledger.sync(a, CHAIN, 5);

    ledger.reserve(a, CHAIN, 5).unwrap();
    ledger.confirm(a, CHAIN, 5);
    ledger.reserve(a, CHAIN, 6).unwrap();
    ledger.release(a, CHAIN, 6);

    assert_eq!(ledger.current_nonce(a, CHAIN), 6);
    assert_eq!(ledger.used_nonces(a, CHAIN), BTreeSet::from([5]));
    assert!(ledger.pending_nonces(a, CHAIN).is_empty());
    assert_eq!(ledger.next_nonce(a, CHAIN), 6);
}

#[test]
fn racing_threads_reserve_same_nonce_once() {
    let ledger = NonceLedger::new();
    let a = account();
    let threads = 16;
    let start = Barrier::new(threads);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(|| {
                    start.wait();
                    ledger.reserve(a, CHAIN, 0)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_eq!(result, &Err(LedgerError::AlreadyPending { nonce: 0 }));
    }
    assert_eq!(ledger.pending_nonces(a, CHAIN), BTreeSet::from([0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserve_next_hands_out_distinct_nonces() {
    let ledger = Arc::new(NonceLedger::new());
    let a = account();
    ledger.sync(a, CHAIN, 40);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.reserve_next(a, CHAIN).await })
        })
        .collect();
    let mut reservations = Vec::new();
    for task in futures::future::join_all(tasks).await {
        reservations.push(task.unwrap().unwrap());
    }

    let nonces: BTreeSet<Nonce> = reservations.iter().map(|r| r.nonce()).collect();
    assert_eq!(nonces, (40..72).collect::<BTreeSet<Nonce>>());
    assert_eq!(ledger.pending_nonces(a, CHAIN), nonces);

    drop(reservations);
    assert!(ledger.pending_nonces(a, CHAIN).is_empty());
}
