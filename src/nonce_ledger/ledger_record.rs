//! Per-(account, chain) nonce record
//!
//! Every mutation is a named transition that either applies fully or fails
//! without touching the record. The ledger applies them in place under the
//! record lock and hands out cloned snapshots; the `with_*` forms chain
//! transitions on an owned value. Invariants, checkable on any snapshot:
//!
//! - `used_nonces` and `pending_nonces` are disjoint
//! - a nonce never moves from used back to pending
//! - `current_nonce` is at least the highest used nonce plus one

use super::ledger_errors::{LedgerError, LedgerResult};
use crate::types::Nonce;
use std::collections::BTreeSet;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct NonceRecord {
    current_nonce: Nonce,
    used_nonces: BTreeSet<Nonce>,
    pending_nonces: BTreeSet<Nonce>,
    last_updated: Instant,
}

/// Records compare by nonce state only; `last_updated` is bookkeeping.
impl PartialEq for NonceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.current_nonce == other.current_nonce
            && self.used_nonces == other.used_nonces
            && self.pending_nonces == other.pending_nonces
    }
}

impl Eq for NonceRecord {}

impl Default for NonceRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceRecord {
    /// Zero-value record, as created lazily on first use
    pub fn new() -> Self {
        Self {
            current_nonce: 0,
            used_nonces: BTreeSet::new(),
            pending_nonces: BTreeSet::new(),
            last_updated: Instant::now(),
        }
    }

    pub fn current_nonce(&self) -> Nonce {
        self.current_nonce
    }

    pub fn used_nonces(&self) -> &BTreeSet<Nonce> {
        &self.used_nonces
    }

    pub fn pending_nonces(&self) -> &BTreeSet<Nonce> {
        &self.pending_nonces
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    pub fn is_used(&self, nonce: Nonce) -> bool {
        self.used_nonces.contains(&nonce)
    }

    pub fn is_pending(&self, nonce: Nonce) -> bool {
        self.pending_nonces.contains(&nonce)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_updated)
    }

    /// Lowest nonce at or above `current_nonce` that is neither used nor pending
    pub fn next_nonce(&self) -> Nonce {
        let mut candidate = self.current_nonce;
        while self.used_nonces.contains(&candidate) || self.pending_nonces.contains(&candidate) {
            candidate += 1;
        }
        candidate
    }

    // ========================================================================
    // IN-PLACE TRANSITIONS
    // ========================================================================
    //
    // Each transition validates before it mutates: it either applies fully or
    // leaves the record untouched. The ledger runs them under the record lock.

    /// Reserve `nonce` for an in-flight transaction
    pub fn reserve(&mut self, nonce: Nonce) -> LedgerResult<()> {
        if self.used_nonces.contains(&nonce) {
            return Err(LedgerError::AlreadyUsed { nonce });
        }
        if self.pending_nonces.contains(&nonce) {
            return Err(LedgerError::AlreadyPending { nonce });
        }
        if nonce < self.current_nonce {
            return Err(LedgerError::TooLow {
                nonce,
                current: self.current_nonce,
            });
        }
        self.pending_nonces.insert(nonce);
        self.touch();
        Ok(())
    }

    /// Drop a reservation. Releasing a nonce that is not pending is a no-op.
    pub fn release(&mut self, nonce: Nonce) {
        self.pending_nonces.remove(&nonce);
        self.touch();
    }

    /// Mark `nonce` as consumed on-chain, whether or not it was reserved here
    pub fn confirm(&mut self, nonce: Nonce) {
        self.pending_nonces.remove(&nonce);
        self.used_nonces.insert(nonce);
        self.current_nonce = self.current_nonce.max(nonce.saturating_add(1));
        self.touch();
    }

    /// Accept an externally chosen nonce
    ///
    /// Nonces skipped between `current_nonce` and `nonce` are parked as
    /// pending until a later confirm or sync settles them. A jump of more
    /// than `max_gap` is rejected; the record should be synced instead.
    pub fn consume(&mut self, nonce: Nonce, max_gap: u64) -> LedgerResult<()> {
        if nonce < self.current_nonce {
            return Err(LedgerError::TooLow {
                nonce,
                current: self.current_nonce,
            });
        }
        if self.used_nonces.contains(&nonce) {
            return Err(LedgerError::AlreadyUsed { nonce });
        }
        if nonce - self.current_nonce > max_gap {
            return Err(LedgerError::GapTooLarge {
                nonce,
                current: self.current_nonce,
                max_gap,
            });
        }
        for gap in self.current_nonce..nonce {
            if !self.used_nonces.contains(&gap) {
                self.pending_nonces.insert(gap);
            }
        }
        self.pending_nonces.remove(&nonce);
        self.used_nonces.insert(nonce);
        self.current_nonce = nonce.saturating_add(1);
        self.touch();
        Ok(())
    }

    /// Reconcile with the chain's next expected nonce
    ///
    /// Entries below `truth` are settled by the chain and purged. The new
    /// current nonce is `truth`, or one past the highest locally used nonce
    /// that the chain has not counted yet.
    pub fn sync(&mut self, truth: Nonce) {
        self.used_nonces = self.used_nonces.split_off(&truth);
        self.pending_nonces = self.pending_nonces.split_off(&truth);
        let above_truth = self
            .used_nonces
            .iter()
            .next_back()
            .map(|n| n.saturating_add(1))
            .unwrap_or(0);
        self.current_nonce = truth.max(above_truth);
        self.touch();
    }

    // ========================================================================
    // SNAPSHOT TRANSITIONS
    // ========================================================================

    pub fn with_reserved(mut self, nonce: Nonce) -> LedgerResult<Self> {
        self.reserve(nonce)?;
        Ok(self)
    }

    pub fn with_released(mut self, nonce: Nonce) -> Self {
        self.release(nonce);
        self
    }

    pub fn with_confirmed(mut self, nonce: Nonce) -> Self {
        self.confirm(nonce);
        self
    }

    pub fn with_consumed(mut self, nonce: Nonce, max_gap: u64) -> LedgerResult<Self> {
        self.consume(nonce, max_gap)?;
        Ok(self)
    }

    pub fn with_synced(mut self, truth: Nonce) -> Self {
        self.sync(truth);
        self
    }

    /// Invariant check used by tests and debug assertions
    pub fn is_consistent(&self) -> bool {
        let disjoint = self.used_nonces.is_disjoint(&self.pending_nonces);
        let above_used = self
            .used_nonces
            .iter()
            .next_back()
            .map(|max| self.current_nonce > *max)
            .unwrap_or(true);
        disjoint && above_used
    }

    fn touch(&mut self) {
        self.last_updated = Instant::now();
    }
}
