//! Structured logging and pipeline event logger

use crate::errors::PipelineError;
use crate::observability::CorrelationId;
use crate::types::{Address, ChainId, Nonce};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Install the global tracing subscriber, writing to stderr
///
/// `RUST_LOG` overrides `default_level` when set. Fails if a subscriber is
/// already installed.
pub fn init_logging(default_level: &str, format: LogFormat) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init()?,
    }

    tracing::debug!(?format, "Logging initialized");
    Ok(())
}

/// Structured logger for pipeline events, bound to one correlation id
///
/// Payloads and signatures are never logged, only their sizes.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    correlation_id: CorrelationId,
}

impl StructuredLogger {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self { correlation_id }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn log_request_received(&self, kind: &str, account: &str, chain_id: u64, payload_len: usize) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            kind = %kind,
            account = %account,
            chain_id = chain_id,
            payload_len = payload_len,
            "Signing request received"
        );
    }

    pub fn log_stage_passed(&self, stage: &str, warnings: usize) {
        tracing::debug!(
            correlation_id = %self.correlation_id,
            stage = %stage,
            warnings = warnings,
            "Stage passed"
        );
    }

    pub fn log_stage_rejected(&self, stage: &str, error: &PipelineError) {
        tracing::warn!(
            correlation_id = %self.correlation_id,
            stage = %stage,
            reason = error.reason_code(),
            error = %error,
            "Stage rejected request"
        );
    }

    pub fn log_warning(&self, stage: &str, code: &str, message: &str) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            stage = %stage,
            code = %code,
            message = %message,
            "Pipeline warning"
        );
    }

    pub fn log_nonce_operation(
        &self,
        operation: &str,
        account: Address,
        chain_id: ChainId,
        nonce: Nonce,
    ) {
        tracing::debug!(
            correlation_id = %self.correlation_id,
            operation = %operation,
            %account,
            %chain_id,
            nonce = nonce,
            "Nonce operation"
        );
    }

    pub fn log_signed(&self, kind: &str, signature_len: usize, latency_ms: u64) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            kind = %kind,
            signature_len = signature_len,
            latency_ms = latency_ms,
            "Request signed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_logger_keeps_correlation_id() {
        let id = CorrelationId::from("req-1");
        let logger = StructuredLogger::new(id.clone());
        assert_eq!(logger.correlation_id(), &id);
        logger.log_stage_passed("shape", 0);
    }
}
