use crate::chain_source::ChainSourceError;
use crate::types::{Address, ChainId, Nonce};
use thiserror::Error;

/// Nonce ledger errors
///
/// Every variant except `Source` describes a nonce reuse or regression and is
/// fatal for the signing attempt that triggered it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    /// Nonce was already consumed by an accepted transaction
    #[error("nonce {nonce} already used")]
    AlreadyUsed { nonce: Nonce },

    /// Nonce is reserved by an in-flight transaction
    #[error("nonce {nonce} already pending")]
    AlreadyPending { nonce: Nonce },

    /// Nonce is below the next expected nonce
    #[error("nonce {nonce} too low (current {current})")]
    TooLow { nonce: Nonce, current: Nonce },

    /// Nonce skips further ahead of the record than the ledger accepts
    #[error("nonce {nonce} is more than {max_gap} ahead of current {current}")]
    GapTooLarge {
        nonce: Nonce,
        current: Nonce,
        max_gap: u64,
    },

    /// Record is being reconciled with chain truth
    #[error("nonce record for {account} on chain {chain_id} is being reconciled")]
    Reconciling { account: Address, chain_id: ChainId },

    /// Chain-truth source failed during reconciliation
    #[error("chain source error: {0}")]
    Source(#[from] ChainSourceError),
}

impl LedgerError {
    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::AlreadyUsed { .. } => "already_used",
            LedgerError::AlreadyPending { .. } => "already_pending",
            LedgerError::TooLow { .. } => "too_low",
            LedgerError::GapTooLarge { .. } => "gap_too_large",
            LedgerError::Reconciling { .. } => "reconciling",
            LedgerError::Source(_) => "source",
        }
    }

    /// Whether asking again (after a fresh `next_nonce`) can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Reconciling { .. } | LedgerError::Source(_))
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
