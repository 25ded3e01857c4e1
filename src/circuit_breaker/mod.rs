//! Circuit Breaker Module
//!
//! Per-dependency failure isolation with a Closed / Open / Half-Open state
//! machine, typed failure classification, fallbacks and state-change
//! listeners.

// Submodules
pub mod breaker;
pub mod breaker_errors;
pub mod breaker_events;
pub mod breaker_registry;

// Re-exports for convenience
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use breaker_errors::{BreakerError, ClassifyFailure, FailureKind};
pub use breaker_events::{BreakerMetrics, StateChangeEvent, SubscriptionId};
pub use breaker_registry::{Dependency, DependencyRegistry};
