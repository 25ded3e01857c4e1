//! Error taxonomy for the signing pipeline
//!
//! Every failure a caller can see maps to one `PipelineError` variant with a
//! stable reason code. Component errors (`LedgerError`, `SignerError`,
//! breaker rejections) are converted at the stage that produced them.

use crate::nonce_ledger::LedgerError;
use crate::pipeline::risk::RiskLevel;
use crate::pipeline::signer::SignerError;
use crate::types::{Address, ChainId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Request targets a different chain than the signer is connected to
    #[error("chain mismatch: request targets chain {requested}, signer is on chain {connected}")]
    ChainMismatch {
        requested: ChainId,
        connected: ChainId,
    },

    /// Request names an account the signer does not control
    #[error("account mismatch: request account {requested}, signer account {signer}")]
    AccountMismatch { requested: Address, signer: Address },

    /// Risk screening refused the request
    #[error("blocked due to {level} risk: {}", .reasons.join("; "))]
    RiskBlocked {
        level: RiskLevel,
        reasons: Vec<String>,
    },

    /// A request field failed structural validation
    #[error("malformed request field '{field}': {reason}")]
    MalformedRequest { field: String, reason: String },

    #[error("invalid gas parameters: {0}")]
    InvalidGasParameters(String),

    /// Nonce reservation or validation conflicted with the ledger
    #[error("nonce conflict: {0}")]
    NonceConflict(#[from] LedgerError),

    /// Dry run reverted
    #[error("simulation reverted: {reason}")]
    SimulationReverted { reason: String },

    #[error("signer failure: {0}")]
    SignerFailure(#[from] SignerError),

    /// A network dependency is unavailable (open breaker, no usable fallback)
    #[error("{dependency} unavailable{}", .cause.as_ref().map(|c| format!(": {}", c)).unwrap_or_default())]
    DependencyUnavailable {
        dependency: String,
        cause: Option<String>,
    },

    #[error("signing request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable reason code
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ChainMismatch { .. } => "CHAIN_MISMATCH",
            Self::AccountMismatch { .. } => "ACCOUNT_MISMATCH",
            Self::RiskBlocked { .. } => "RISK_BLOCKED",
            Self::MalformedRequest { .. } => "MALFORMED_REQUEST",
            Self::InvalidGasParameters(_) => "INVALID_GAS_PARAMETERS",
            Self::NonceConflict(_) => "NONCE_CONFLICT",
            Self::SimulationReverted { .. } => "SIMULATION_REVERTED",
            Self::SignerFailure(_) => "SIGNER_FAILURE",
            Self::DependencyUnavailable { .. } => "DEPENDENCY_UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the caller may resubmit the same request unchanged
    ///
    /// Validation failures need the user to change the request; nonce
    /// conflicts need a fresh nonce and are never retried automatically.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DependencyUnavailable { .. } => true,
            Self::SignerFailure(err) => err.is_transient(),
            Self::Cancelled => true,

            Self::ChainMismatch { .. }
            | Self::AccountMismatch { .. }
            | Self::RiskBlocked { .. }
            | Self::MalformedRequest { .. }
            | Self::InvalidGasParameters(_)
            | Self::NonceConflict(_)
            | Self::SimulationReverted { .. }
            | Self::Internal(_) => false,
        }
    }

    /// Error category for metrics and observability
    pub fn category(&self) -> &'static str {
        match self {
            Self::ChainMismatch { .. }
            | Self::AccountMismatch { .. }
            | Self::MalformedRequest { .. }
            | Self::InvalidGasParameters(_) => "validation",
            Self::RiskBlocked { .. } => "risk",
            Self::NonceConflict(_) => "nonce",
            Self::SimulationReverted { .. } => "simulation",
            Self::SignerFailure(_) => "signing",
            Self::DependencyUnavailable { .. } => "dependency",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

// Convenience constructors for common error scenarios
impl PipelineError {
    pub fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRequest {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_gas(reason: impl Into<String>) -> Self {
        Self::InvalidGasParameters(reason.into())
    }

    pub fn reverted(reason: impl Into<String>) -> Self {
        Self::SimulationReverted {
            reason: reason.into(),
        }
    }

    pub fn unavailable(dependency: impl Into<String>, cause: Option<String>) -> Self {
        Self::DependencyUnavailable {
            dependency: dependency.into(),
            cause,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Result of a single pipeline stage
pub type StageResult<T> = Result<T, PipelineError>;
