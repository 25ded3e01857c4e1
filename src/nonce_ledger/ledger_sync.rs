//! Post-submission confirmation driven by chain truth

use super::ledger::NonceLedger;
use super::ledger_errors::LedgerResult;
use crate::chain_source::{ChainTruthSource, Receipt};
use crate::types::{Address, ChainId, Nonce, TxHash};
use std::sync::Arc;
use tracing::{info, warn};

/// Final state of a tracked transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Mined; the nonce is now used
    Confirmed(Receipt),
    /// Dropped or the wait failed; the nonce was released
    Released { reason: String },
}

/// Settles committed nonces once their transactions land or disappear
pub struct ConfirmationTracker {
    ledger: Arc<NonceLedger>,
    source: Arc<dyn ChainTruthSource>,
}

impl ConfirmationTracker {
    pub fn new(ledger: Arc<NonceLedger>, source: Arc<dyn ChainTruthSource>) -> Self {
        Self { ledger, source }
    }

    /// Wait for `hash` and confirm or release `nonce` accordingly
    ///
    /// A reverted receipt still consumes the nonce.
    pub async fn track(
        &self,
        account: Address,
        chain_id: ChainId,
        nonce: Nonce,
        hash: TxHash,
    ) -> ConfirmationStatus {
        match self.source.wait_for_receipt(chain_id, hash).await {
            Ok(receipt) => {
                self.ledger.confirm(account, chain_id, nonce);
                info!(
                    %account,
                    %chain_id,
                    nonce,
                    tx_hash = %hash,
                    block = receipt.block_number,
                    reverted = !receipt.success,
                    "Transaction mined, nonce confirmed"
                );
                ConfirmationStatus::Confirmed(receipt)
            }
            Err(err) => {
                self.ledger.release(account, chain_id, nonce);
                warn!(%account, %chain_id, nonce, tx_hash = %hash, error = %err, "Transaction not mined, nonce released");
                ConfirmationStatus::Released {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Spawn [`ConfirmationTracker::track`] in the background
    pub fn spawn_track(
        self: &Arc<Self>,
        account: Address,
        chain_id: ChainId,
        nonce: Nonce,
        hash: TxHash,
    ) -> tokio::task::JoinHandle<ConfirmationStatus> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move { tracker.track(account, chain_id, nonce, hash).await })
    }

    /// Reconcile the record with the chain's transaction count
    pub async fn reconcile(&self, account: Address, chain_id: ChainId) -> LedgerResult<Nonce> {
        self.ledger
            .sync_from_source(account, chain_id, self.source.as_ref())
            .await
    }
}

impl std::fmt::Debug for ConfirmationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationTracker")
            .field("records", &self.ledger.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_source::ChainSourceError;
    use async_trait::async_trait;

    struct ReceiptSource {
        mined: bool,
        count: Nonce,
    }

    #[async_trait]
    impl ChainTruthSource for ReceiptSource {
        async fn estimate_gas(
            &self,
            _chain_id: ChainId,
            _from: Address,
            _to: Option<Address>,
            _value: u128,
            _data: &[u8],
        ) -> Result<u64, ChainSourceError> {
            Ok(21_000)
        }

        async fn get_transaction_count(
            &self,
            _account: Address,
            _chain_id: ChainId,
        ) -> Result<Nonce, ChainSourceError> {
            Ok(self.count)
        }

        async fn wait_for_receipt(
            &self,
            _chain_id: ChainId,
            hash: TxHash,
        ) -> Result<Receipt, ChainSourceError> {
            if self.mined {
                Ok(Receipt {
                    hash,
                    block_number: 42,
                    success: false,
                })
            } else {
                Err(ChainSourceError::Dropped(hash))
            }
        }
    }

    const CHAIN: ChainId = ChainId(137);

    #[tokio::test]
    async fn test_track_confirms_mined_transaction() {
        let ledger = Arc::new(NonceLedger::new());
        let acct = Address::from_bytes([7; 20]);
        let nonce = ledger.reserve_next(acct, CHAIN).await.unwrap().commit();
        let tracker = Arc::new(ConfirmationTracker::new(
            Arc::clone(&ledger),
            Arc::new(ReceiptSource { mined: true, count: 1 }),
        ));

        let status = tracker
            .spawn_track(acct, CHAIN, nonce, TxHash([1; 32]))
            .await
            .unwrap();
        assert!(matches!(status, ConfirmationStatus::Confirmed(ref r) if !r.success));
        assert!(ledger.used_nonces(acct, CHAIN).contains(&nonce));
        assert!(ledger.pending_nonces(acct, CHAIN).is_empty());
    }

    #[tokio::test]
    async fn test_track_releases_dropped_transaction() {
        let ledger = Arc::new(NonceLedger::new());
        let acct = Address::from_bytes([7; 20]);
        let nonce = ledger.reserve_next(acct, CHAIN).await.unwrap().commit();
        let tracker = ConfirmationTracker::new(
            Arc::clone(&ledger),
            Arc::new(ReceiptSource { mined: false, count: 0 }),
        );

        let status = tracker.track(acct, CHAIN, nonce, TxHash([2; 32])).await;
        assert!(matches!(status, ConfirmationStatus::Released { .. }));
        assert!(ledger.pending_nonces(acct, CHAIN).is_empty());
        assert!(ledger.used_nonces(acct, CHAIN).is_empty());
        assert_eq!(ledger.next_nonce(acct, CHAIN), nonce);
    }

    #[tokio::test]
    async fn test_reconcile_uses_transaction_count() {
        let ledger = Arc::new(NonceLedger::new());
        let acct = Address::from_bytes([7; 20]);
        let tracker = ConfirmationTracker::new(
            Arc::clone(&ledger),
            Arc::new(ReceiptSource { mined: true, count: 12 }),
        );
        assert_eq!(tracker.reconcile(acct, CHAIN).await.unwrap(), 12);
        assert_eq!(ledger.next_nonce(acct, CHAIN), 12);
    }
}
