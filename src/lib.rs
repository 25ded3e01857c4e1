//! signguard - outbound transaction safety layer
//!
//! Three cooperating components guard every signature that leaves the
//! process:
//!
//! - [`nonce_ledger`]: per-account, per-chain nonce reservation with
//!   confirmation, release and reconciliation against chain truth
//! - [`circuit_breaker`]: failure isolation for the network dependencies the
//!   pipeline calls
//! - [`pipeline`]: ordered validation, simulation and signing of requests

pub mod chain_source;
pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod nonce_ledger;
pub mod observability;
pub mod pipeline;
pub mod structured_logging;
pub mod types;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, Dependency, DependencyRegistry};
pub use config::Config;
pub use errors::PipelineError;
pub use nonce_ledger::{NonceLedger, NonceReservation};
pub use pipeline::{PipelineResult, SigningPipeline, SigningRequest};
pub use types::{Address, ChainId, Nonce};
