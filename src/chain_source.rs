//! Chain-truth boundary
//!
//! The authoritative view of an account's on-chain state. Used to drive
//! ledger reconciliation, post-submission confirmation and, when configured,
//! the gas-estimate fallback for an unavailable simulator.

use crate::circuit_breaker::{ClassifyFailure, FailureKind};
use crate::types::{Address, ChainId, Nonce, TxHash};
use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a chain-truth source
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChainSourceError {
    /// HTTP-level failure with status code
    #[error("chain source returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection-level failure
    #[error("chain source network error: {0}")]
    Network(String),

    /// Request timed out at the transport
    #[error("chain source timed out after {0}ms")]
    Timeout(u64),

    /// Transaction was dropped from the mempool without a receipt
    #[error("transaction {0} dropped without receipt")]
    Dropped(TxHash),

    /// Node answered with a JSON-RPC error
    #[error("chain source RPC error: {0}")]
    Rpc(String),
}

impl ClassifyFailure for ChainSourceError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            ChainSourceError::Http { status, .. } if *status >= 500 => {
                FailureKind::Server { status: *status }
            }
            ChainSourceError::Http { status, .. } => FailureKind::Client { status: *status },
            ChainSourceError::Network(_) => FailureKind::Network,
            ChainSourceError::Timeout(_) => FailureKind::Timeout,
            ChainSourceError::Dropped(_) | ChainSourceError::Rpc(_) => FailureKind::Application,
        }
    }
}

/// Receipt of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub hash: TxHash,
    pub block_number: u64,
    /// False when the transaction was mined but reverted. The nonce is consumed either way.
    pub success: bool,
}

/// Authoritative on-chain state for an account
#[async_trait]
pub trait ChainTruthSource: Send + Sync {
    /// Estimate the gas a call would use
    async fn estimate_gas(
        &self,
        chain_id: ChainId,
        from: Address,
        to: Option<Address>,
        value: u128,
        data: &[u8],
    ) -> Result<u64, ChainSourceError>;

    /// Next nonce the chain expects from `account` (count of mined transactions)
    async fn get_transaction_count(
        &self,
        account: Address,
        chain_id: ChainId,
    ) -> Result<Nonce, ChainSourceError>;

    /// Wait until `hash` is mined, or fail if it is dropped
    async fn wait_for_receipt(
        &self,
        chain_id: ChainId,
        hash: TxHash,
    ) -> Result<Receipt, ChainSourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_source_error_classification() {
        let err = ChainSourceError::Http {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert_eq!(err.failure_kind(), FailureKind::Server { status: 503 });

        let err = ChainSourceError::Http {
            status: 429,
            message: "slow down".to_string(),
        };
        assert_eq!(err.failure_kind(), FailureKind::Client { status: 429 });

        assert_eq!(ChainSourceError::Timeout(5000).failure_kind(), FailureKind::Timeout);
        assert_eq!(
            ChainSourceError::Network("reset".to_string()).failure_kind(),
            FailureKind::Network
        );
        assert_eq!(
            ChainSourceError::Rpc("nonce too low".to_string()).failure_kind(),
            FailureKind::Application
        );
    }
}
