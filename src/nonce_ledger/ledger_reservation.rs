//! RAII reservation of a single nonce
//!
//! A `NonceReservation` is handed out by [`NonceLedger::reserve_next`]. It
//! holds the nonce in the ledger's pending set and guarantees exactly one of:
//!
//! - `commit()`: the signed transaction leaves the pipeline, the nonce stays
//!   pending and the caller later confirms or releases it
//! - `confirm()`: the nonce is consumed
//! - `release()` or drop: the nonce becomes free again
//!
//! Dropping the guard covers every path where the owning future is cancelled
//! between reservation and signing.

use super::ledger::NonceLedger;
use crate::metrics::metrics;
use crate::types::{Address, ChainId, Nonce};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct NonceReservation {
    ledger: Arc<NonceLedger>,
    account: Address,
    chain_id: ChainId,
    nonce: Nonce,
    acquired_at: Instant,
    armed: bool,
}

impl NonceReservation {
    pub(crate) fn new(
        ledger: Arc<NonceLedger>,
        account: Address,
        chain_id: ChainId,
        nonce: Nonce,
    ) -> Self {
        Self {
            ledger,
            account,
            chain_id,
            nonce,
            acquired_at: Instant::now(),
            armed: true,
        }
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn account(&self) -> Address {
        self.account
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Keep the nonce pending and hand responsibility to the caller
    pub fn commit(mut self) -> Nonce {
        self.armed = false;
        debug!(
            account = %self.account,
            chain_id = %self.chain_id,
            nonce = self.nonce,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Nonce reservation committed"
        );
        self.nonce
    }

    /// Mark the nonce consumed
    pub fn confirm(mut self) {
        self.armed = false;
        self.ledger.confirm(self.account, self.chain_id, self.nonce);
    }

    /// Free the nonce explicitly
    pub fn release(mut self) {
        self.armed = false;
        self.ledger.release(self.account, self.chain_id, self.nonce);
        metrics().nonce_releases_explicit.inc();
    }
}

impl std::fmt::Debug for NonceReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceReservation")
            .field("account", &self.account)
            .field("chain_id", &self.chain_id)
            .field("nonce", &self.nonce)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Drop for NonceReservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.ledger.release(self.account, self.chain_id, self.nonce);
        metrics().nonce_releases_on_drop.inc();
        warn!(
            account = %self.account,
            chain_id = %self.chain_id,
            nonce = self.nonce,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Nonce reservation dropped without commit, nonce released"
        );
    }
}
