//! Correlation ids and per-run tracing spans

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Id shared by every log line and metric label of one signing run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who a run is for, attached to its root span
///
/// Account and chain are recorded as the caller supplied them, before any
/// validation, so rejected requests are still traceable.
#[derive(Debug, Clone)]
pub struct TraceContext {
    operation: &'static str,
    correlation_id: CorrelationId,
    account: Option<String>,
    chain_id: Option<u64>,
}

impl TraceContext {
    pub fn new(operation: &'static str, correlation_id: CorrelationId) -> Self {
        Self {
            operation,
            correlation_id,
            account: None,
            chain_id: None,
        }
    }

    pub fn for_request(mut self, account: &str, chain_id: u64) -> Self {
        self.account = Some(account.to_string());
        self.chain_id = Some(chain_id);
        self
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Root span for the run
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "signing_run",
            operation = self.operation,
            correlation_id = %self.correlation_id,
            account = self.account.as_deref().unwrap_or("-"),
            chain_id = self.chain_id.unwrap_or_default(),
        )
    }

    /// Child span for one network-bound stage
    pub fn stage_span(&self, stage: &str) -> tracing::Span {
        tracing::debug_span!("stage", stage, correlation_id = %self.correlation_id)
    }
}
