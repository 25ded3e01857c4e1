//! Simulator boundary
//!
//! Dry runs are network calls and always go through the `Simulation`
//! breaker. When that breaker is open the pipeline either fails the request
//! or, under [`SimulationFallbackPolicy::EstimateOnly`], asks the chain-truth
//! source for a bare gas estimate.

use crate::chain_source::{ChainSourceError, ChainTruthSource};
use crate::circuit_breaker::{ClassifyFailure, FailureKind};
use crate::pipeline::request::TransactionFields;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Behaviour when the simulation dependency is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationFallbackPolicy {
    /// Fail the request with `DependencyUnavailable`
    #[default]
    Block,
    /// Continue on a chain-truth gas estimate, with a warning
    EstimateOnly,
}

impl FromStr for SimulationFallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(SimulationFallbackPolicy::Block),
            "estimate_only" => Ok(SimulationFallbackPolicy::EstimateOnly),
            other => Err(format!("unknown simulation fallback policy '{}'", other)),
        }
    }
}

/// Result of a dry run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SimulationOutcome {
    pub success: bool,
    pub revert_reason: Option<String>,
    pub gas_estimate: u64,
    pub estimated_cost_wei: u128,
    pub warnings: Vec<String>,
    /// False when the outcome came from a gas estimate instead of a dry run
    pub simulated: bool,
}

impl SimulationOutcome {
    pub fn succeeded(gas_estimate: u64, estimated_cost_wei: u128) -> Self {
        Self {
            success: true,
            gas_estimate,
            estimated_cost_wei,
            simulated: true,
            ..Self::default()
        }
    }

    pub fn reverted(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            revert_reason: Some(reason.into()),
            simulated: true,
            ..Self::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Errors from the simulation endpoint; a revert is an outcome, not an error
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimulationError {
    #[error("simulator returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("simulator network error: {0}")]
    Network(String),

    #[error("simulator timed out after {0}ms")]
    Timeout(u64),

    /// Response could not be interpreted
    #[error("simulator response invalid: {0}")]
    Decode(String),

    /// Chain-truth estimate used as a fallback failed
    #[error(transparent)]
    Source(#[from] ChainSourceError),
}

impl ClassifyFailure for SimulationError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            SimulationError::Http { status, .. } => FailureKind::from_status(*status),
            SimulationError::Network(_) => FailureKind::Network,
            SimulationError::Timeout(_) => FailureKind::Timeout,
            SimulationError::Decode(_) => FailureKind::Application,
            SimulationError::Source(err) => err.failure_kind(),
        }
    }
}

/// Dry-run execution against current chain state
///
/// Implementations enforce their own timeouts and report them as
/// [`SimulationError::Timeout`].
#[async_trait]
pub trait Simulator: Send + Sync {
    async fn simulate(&self, fields: &TransactionFields) -> Result<SimulationOutcome, SimulationError>;
}

/// Fallback outcome built from `estimate_gas` alone
pub async fn estimate_only(
    source: &dyn ChainTruthSource,
    fields: &TransactionFields,
) -> Result<SimulationOutcome, SimulationError> {
    let gas_estimate = source
        .estimate_gas(
            fields.chain_id,
            fields.from,
            fields.to,
            fields.value,
            &fields.data,
        )
        .await?;
    let price = fields.pricing.map(|p| p.max_price()).unwrap_or(0);
    Ok(SimulationOutcome {
        success: true,
        revert_reason: None,
        gas_estimate,
        estimated_cost_wei: price.saturating_mul(u128::from(gas_estimate)),
        warnings: Vec::new(),
        simulated: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::request::GasPricing;
    use crate::pipeline::testing::StaticChainSource;
    use crate::types::{Address, ChainId};

    #[test]
    fn test_error_classification() {
        let server = SimulationError::Http {
            status: 502,
            message: "bad gateway".into(),
        };
        assert_eq!(server.failure_kind(), FailureKind::Server { status: 502 });
        assert_eq!(SimulationError::Decode("eof".into()).failure_kind(), FailureKind::Application);
        assert_eq!(
            SimulationError::from(ChainSourceError::Timeout(100)).failure_kind(),
            FailureKind::Timeout
        );
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            "estimate_only".parse::<SimulationFallbackPolicy>().unwrap(),
            SimulationFallbackPolicy::EstimateOnly
        );
        assert!("skip".parse::<SimulationFallbackPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_estimate_only_outcome() {
        let source = StaticChainSource::new(0).with_gas_estimate(40_000);
        let fields = TransactionFields {
            chain_id: ChainId(1),
            from: Address::from_bytes([1; 20]),
            to: Some(Address::from_bytes([2; 20])),
            value: 0,
            data: vec![],
            nonce: 0,
            gas_limit: None,
            pricing: Some(GasPricing::Legacy { gas_price: 10 }),
        };
        let outcome = estimate_only(&source, &fields).await.unwrap();
        assert!(outcome.success);
        assert!(!outcome.simulated);
        assert_eq!(outcome.gas_estimate, 40_000);
        assert_eq!(outcome.estimated_cost_wei, 400_000);
    }
}
