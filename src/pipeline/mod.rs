//! Signing Pipeline Module
//!
//! Ordered validation and signing of outbound transactions, messages and
//! typed data. Local stages run synchronously; simulation and quote lookups
//! go through their circuit breakers.

// Submodules
pub mod builder;
pub mod output;
pub mod quote;
pub mod request;
pub mod risk;
pub mod signer;
pub mod simulate;
pub mod stages;
pub mod validators;

#[cfg(any(test, feature = "test_utils"))]
pub mod testing;

// Re-exports for convenience
pub use builder::{SigningPipeline, SigningPipelineBuilder};
pub use output::{
    warning_codes, PipelineReport, PipelineResult, RequestKind, SignedArtifact, ValidationReport,
    Warning,
};
pub use quote::{Quote, QuoteError, QuotePair, QuoteProvider, QuoteService};
pub use request::{
    GasFields, GasPricing, MessageRequest, SigningRequest, TransactionFields, TypedData,
    TypedDataRequest,
};
pub use risk::{MediumRiskPolicy, RiskAssessment, RiskLevel, RiskScreener, RuleRiskScreener};
pub use signer::{ExternalSigner, LocalKeySigner, SignerError};
pub use simulate::{SimulationError, SimulationFallbackPolicy, SimulationOutcome, Simulator};
pub use stages::{Stage, ValidatedRequest};
