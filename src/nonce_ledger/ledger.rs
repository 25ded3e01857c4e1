//! Nonce ledger keyed by (account, chain)
//!
//! Records are created lazily on first use and live behind a per-record
//! mutex. Each record also carries a reconciliation lock: reservations take
//! it shared, `sync_from_source` takes it exclusively for the whole round
//! trip to the chain, so no nonce is handed out while a record is being
//! reconciled.

use super::ledger_errors::{LedgerError, LedgerResult};
use super::ledger_record::NonceRecord;
use super::ledger_reservation::NonceReservation;
use crate::chain_source::ChainTruthSource;
use crate::metrics::metrics;
use crate::types::{Address, ChainId, Nonce};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Ledger key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub account: Address,
    pub chain_id: ChainId,
}

impl LedgerKey {
    pub fn new(account: Address, chain_id: ChainId) -> Self {
        Self { account, chain_id }
    }
}

#[derive(Debug, Default)]
struct RecordSlot {
    state: Mutex<NonceRecord>,
    reconcile: RwLock<()>,
}

impl RecordSlot {
    /// Run a transition under the record lock
    fn apply<T, F>(&self, transition: F) -> T
    where
        F: FnOnce(&mut NonceRecord) -> T,
    {
        let mut state = self.state.lock();
        let out = transition(&mut state);
        debug_assert!(state.is_consistent());
        out
    }

    /// Whether the sweeper may drop this slot
    ///
    /// `strong_count` is read while the map shard is write-locked, so no new
    /// handle can be cloned out concurrently.
    fn is_evictable(slot: &Arc<Self>, now: Instant, max_idle: Duration) -> bool {
        if Arc::strong_count(slot) > 1 {
            return false;
        }
        let Ok(_reconcile) = slot.reconcile.try_write() else {
            return false;
        };
        match slot.state.try_lock() {
            Some(record) => record.idle_for(now) > max_idle && record.pending_nonces().is_empty(),
            None => false,
        }
    }
}

/// Largest forward jump `validate_and_consume` accepts by default
pub const DEFAULT_MAX_NONCE_GAP: u64 = 1_024;

/// Per-account, per-chain nonce tracker
#[derive(Debug)]
pub struct NonceLedger {
    records: DashMap<LedgerKey, Arc<RecordSlot>>,
    max_gap: u64,
}

impl Default for NonceLedger {
    fn default() -> Self {
        Self::with_max_gap(DEFAULT_MAX_NONCE_GAP)
    }
}

impl NonceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger whose `validate_and_consume` rejects jumps beyond `max_gap`
    pub fn with_max_gap(max_gap: u64) -> Self {
        Self {
            records: DashMap::new(),
            max_gap,
        }
    }

    pub fn max_gap(&self) -> u64 {
        self.max_gap
    }

    fn slot(&self, key: LedgerKey) -> Arc<RecordSlot> {
        let slot = self
            .records
            .entry(key)
            .or_insert_with(|| {
                debug!(account = %key.account, chain_id = %key.chain_id, "Creating nonce record");
                Arc::new(RecordSlot::default())
            })
            .clone();
        metrics().ledger_records.set(self.records.len() as i64);
        slot
    }

    fn existing_slot(&self, key: LedgerKey) -> Option<Arc<RecordSlot>> {
        self.records.get(&key).map(|entry| entry.value().clone())
    }

    /// Current snapshot; a zero-value record if none exists yet
    pub fn snapshot(&self, account: Address, chain_id: ChainId) -> NonceRecord {
        self.existing_slot(LedgerKey::new(account, chain_id))
            .map(|slot| slot.state.lock().clone())
            .unwrap_or_default()
    }

    pub fn current_nonce(&self, account: Address, chain_id: ChainId) -> Nonce {
        self.snapshot(account, chain_id).current_nonce()
    }

    pub fn pending_nonces(&self, account: Address, chain_id: ChainId) -> BTreeSet<Nonce> {
        self.snapshot(account, chain_id).pending_nonces().clone()
    }

    pub fn used_nonces(&self, account: Address, chain_id: ChainId) -> BTreeSet<Nonce> {
        self.snapshot(account, chain_id).used_nonces().clone()
    }

    /// Lowest free nonce. Does not reserve it.
    pub fn next_nonce(&self, account: Address, chain_id: ChainId) -> Nonce {
        self.slot(LedgerKey::new(account, chain_id))
            .state
            .lock()
            .next_nonce()
    }

    /// Reserve `nonce` for an in-flight transaction
    ///
    /// Fails with `Reconciling` instead of waiting when the record is being
    /// synced; use [`NonceLedger::reserve_next`] from async code.
    pub fn reserve(&self, account: Address, chain_id: ChainId, nonce: Nonce) -> LedgerResult<()> {
        let slot = self.slot(LedgerKey::new(account, chain_id));
        let _shared = slot
            .reconcile
            .try_read()
            .map_err(|_| LedgerError::Reconciling { account, chain_id })?;
        self.reserve_in(&slot, account, chain_id, nonce)
    }

    fn reserve_in(
        &self,
        slot: &RecordSlot,
        account: Address,
        chain_id: ChainId,
        nonce: Nonce,
    ) -> LedgerResult<()> {
        match slot.apply(|record| record.reserve(nonce)) {
            Ok(_) => {
                metrics().nonce_reservations.inc();
                debug!(%account, %chain_id, nonce, "Nonce reserved");
                Ok(())
            }
            Err(err) => {
                metrics().nonce_conflicts.inc();
                warn!(%account, %chain_id, nonce, error = %err, "Nonce reservation rejected");
                Err(err)
            }
        }
    }

    /// Pick the next free nonce and reserve it under one lock acquisition
    ///
    /// Waits for an in-progress reconciliation of the record to finish. The
    /// returned guard releases the nonce on drop unless it is committed.
    pub async fn reserve_next(
        self: &Arc<Self>,
        account: Address,
        chain_id: ChainId,
    ) -> LedgerResult<NonceReservation> {
        let slot = self.slot(LedgerKey::new(account, chain_id));
        let _shared = slot.reconcile.read().await;
        let nonce = slot.apply(|record| {
            let nonce = record.next_nonce();
            record.reserve(nonce).map(|()| nonce)
        })?;
        metrics().nonce_reservations.inc();
        debug!(%account, %chain_id, nonce, "Next nonce reserved");
        Ok(NonceReservation::new(Arc::clone(self), account, chain_id, nonce))
    }

    /// Remove `nonce` from the pending set. Idempotent.
    pub fn release(&self, account: Address, chain_id: ChainId, nonce: Nonce) {
        if let Some(slot) = self.existing_slot(LedgerKey::new(account, chain_id)) {
            slot.apply(|record| {
                if record.is_pending(nonce) {
                    metrics().nonce_releases.inc();
                    debug!(%account, %chain_id, nonce, "Nonce released");
                }
                record.release(nonce);
            });
        }
    }

    /// Record `nonce` as consumed on-chain
    pub fn confirm(&self, account: Address, chain_id: ChainId, nonce: Nonce) {
        let slot = self.slot(LedgerKey::new(account, chain_id));
        let current = slot.apply(|record| {
            if !record.is_pending(nonce) {
                debug!(%account, %chain_id, nonce, "Confirming nonce that was not reserved here");
            }
            record.confirm(nonce);
            record.current_nonce()
        });
        metrics().nonce_confirmations.inc();
        debug!(%account, %chain_id, nonce, current, "Nonce confirmed");
    }

    /// Accept an externally chosen nonce, parking any skipped nonces as pending
    pub fn validate_and_consume(
        &self,
        account: Address,
        chain_id: ChainId,
        nonce: Nonce,
    ) -> LedgerResult<()> {
        let slot = self.slot(LedgerKey::new(account, chain_id));
        let max_gap = self.max_gap;
        match slot.apply(|record| record.consume(nonce, max_gap).map(|()| record.pending_nonces().len())) {
            Ok(pending) => {
                debug!(%account, %chain_id, nonce, pending, "Nonce consumed");
                Ok(())
            }
            Err(err) => {
                metrics().nonce_conflicts.inc();
                warn!(%account, %chain_id, nonce, error = %err, "Nonce rejected");
                Err(err)
            }
        }
    }

    /// Reconcile with an authoritative nonce already fetched by the caller
    pub fn sync(&self, account: Address, chain_id: ChainId, chain_truth_nonce: Nonce) -> Nonce {
        let slot = self.slot(LedgerKey::new(account, chain_id));
        Self::sync_slot(&slot, account, chain_id, chain_truth_nonce)
    }

    fn sync_slot(slot: &RecordSlot, account: Address, chain_id: ChainId, truth: Nonce) -> Nonce {
        let (before, after) = slot.apply(|record| {
            let before = record.current_nonce();
            record.sync(truth);
            (before, record.current_nonce())
        });
        info!(%account, %chain_id, before, truth, after, "Nonce record synced");
        after
    }

    /// Fetch the chain's nonce and reconcile, excluding reservations meanwhile
    pub async fn sync_from_source(
        &self,
        account: Address,
        chain_id: ChainId,
        source: &dyn ChainTruthSource,
    ) -> LedgerResult<Nonce> {
        let slot = self.slot(LedgerKey::new(account, chain_id));
        let _exclusive = slot.reconcile.write().await;
        let truth = source.get_transaction_count(account, chain_id).await?;
        Ok(Self::sync_slot(&slot, account, chain_id, truth))
    }

    /// Drop the record for one chain
    pub fn reset(&self, account: Address, chain_id: ChainId) {
        if self.records.remove(&LedgerKey::new(account, chain_id)).is_some() {
            info!(%account, %chain_id, "Nonce record reset");
        }
        metrics().ledger_records.set(self.records.len() as i64);
    }

    /// Drop every record of `account`, e.g. on disconnect
    pub fn reset_all(&self, account: Address) {
        let before = self.records.len();
        self.records.retain(|key, _| key.account != account);
        info!(%account, removed = before - self.records.len(), "Nonce records reset");
        metrics().ledger_records.set(self.records.len() as i64);
    }

    /// Evict records idle for longer than `max_idle`
    ///
    /// Records with pending nonces, records being reconciled and records
    /// still referenced by an in-flight operation are kept.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, slot| !RecordSlot::is_evictable(slot, now, max_idle));
        let evicted = before.saturating_sub(self.records.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.records.len(), "Evicted idle nonce records");
        }
        metrics().ledger_records.set(self.records.len() as i64);
        evicted
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
