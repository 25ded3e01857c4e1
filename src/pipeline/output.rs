//! Pipeline results and the per-run trace that builds them

use crate::errors::{PipelineError, StageResult};
use crate::metrics::{metrics, Timer};
use crate::observability::CorrelationId;
use crate::pipeline::quote::Quote;
use crate::pipeline::request::TransactionFields;
use crate::pipeline::stages::{Stage, ValidatedRequest};
use crate::structured_logging::StructuredLogger;
use crate::types::{Nonce, SignatureBytes, TxHash};
use serde::Serialize;

/// Warning codes attached by the built-in stages
pub mod warning_codes {
    pub const RISK_LOW: &str = "RISK_LOW";
    pub const RISK_ACKNOWLEDGED: &str = "RISK_ACKNOWLEDGED";
    pub const PAYLOAD_SHORT: &str = "PAYLOAD_SHORT";
    pub const GAS_LIMIT_HIGH: &str = "GAS_LIMIT_HIGH";
    pub const GAS_LIMIT_TIGHT: &str = "GAS_LIMIT_TIGHT";
    pub const FEE_HIGH: &str = "FEE_HIGH";
    pub const GAS_ESTIMATED: &str = "GAS_ESTIMATED";
    pub const SIMULATION_NOTE: &str = "SIMULATION_NOTE";
    pub const SIMULATION_SKIPPED: &str = "SIMULATION_SKIPPED";
    pub const SIMULATION_HIGH_COST: &str = "SIMULATION_HIGH_COST";
    pub const QUOTE_STALE: &str = "QUOTE_STALE";
    pub const QUOTE_UNAVAILABLE: &str = "QUOTE_UNAVAILABLE";
}

/// Non-fatal finding carried alongside the outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub stage: Stage,
    pub code: &'static str,
    pub message: String,
}

impl Warning {
    pub fn new(stage: Stage, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Transaction,
    Message,
    TypedData,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Transaction => "transaction",
            RequestKind::Message => "message",
            RequestKind::TypedData => "typed_data",
        }
    }
}

/// What a successful run hands back
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignedArtifact {
    pub signature: SignatureBytes,
    /// Hash of the signed transaction; `None` for messages and typed data
    pub tx_hash: Option<TxHash>,
    /// Final signed fields, including the assigned nonce
    pub transaction: Option<TransactionFields>,
    pub quote: Option<Quote>,
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub correlation_id: CorrelationId,
    pub kind: RequestKind,
    pub outcome: Result<SignedArtifact, PipelineError>,
    /// Warnings accumulated up to the end of the run or the failing stage
    pub warnings: Vec<Warning>,
    /// Stages that ran, in order, including the failing one
    pub stages: Vec<Stage>,
}

impl PipelineResult {
    pub fn is_signed(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn artifact(&self) -> Option<&SignedArtifact> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&PipelineError> {
        self.outcome.as_ref().err()
    }

    pub fn reason_code(&self) -> Option<&'static str> {
        self.error().map(PipelineError::reason_code)
    }

    /// Nonce committed for a signed transaction
    pub fn nonce(&self) -> Option<Nonce> {
        self.artifact()
            .and_then(|a| a.transaction.as_ref())
            .map(|t| t.nonce)
    }

    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|w| w.code == code)
    }

    pub fn report(&self) -> PipelineReport {
        let artifact = self.artifact();
        PipelineReport {
            correlation_id: self.correlation_id.to_string(),
            kind: self.kind,
            signed: self.is_signed(),
            reason_code: self.reason_code(),
            message: self.error().map(|e| e.to_string()),
            signature: artifact.map(|a| a.signature.to_hex()),
            tx_hash: artifact.and_then(|a| a.tx_hash.map(|h| h.to_string())),
            nonce: self.nonce(),
            warnings: self.warnings.clone(),
            stages: self.stages.clone(),
        }
    }
}

/// Serializable summary of a [`PipelineResult`]
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub correlation_id: String,
    pub kind: RequestKind,
    pub signed: bool,
    pub reason_code: Option<&'static str>,
    pub message: Option<String>,
    pub signature: Option<String>,
    pub tx_hash: Option<String>,
    pub nonce: Option<Nonce>,
    pub warnings: Vec<Warning>,
    pub stages: Vec<Stage>,
}

/// Verdict of the local stages only
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub reason_code: Option<&'static str>,
    pub message: Option<String>,
    pub request: Option<ValidatedRequest>,
    pub warnings: Vec<Warning>,
    pub stages: Vec<Stage>,
}

/// Accumulates stages and warnings while a request moves through the pipeline
#[derive(Debug)]
pub struct RunTrace {
    logger: StructuredLogger,
    warnings: Vec<Warning>,
    stages: Vec<Stage>,
}

impl RunTrace {
    pub fn new(logger: StructuredLogger) -> Self {
        Self {
            logger,
            warnings: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Record a stage that was timed by the caller
    pub fn record<T>(
        &mut self,
        stage: Stage,
        timer: Timer,
        result: StageResult<(T, Vec<Warning>)>,
    ) -> StageResult<T> {
        timer.observe_stage(stage.as_str());
        self.stages.push(stage);
        match result {
            Ok((value, warnings)) => {
                for warning in &warnings {
                    metrics()
                        .pipeline_warnings
                        .with_label_values(&[warning.code])
                        .inc();
                    self.logger
                        .log_warning(stage.as_str(), warning.code, &warning.message);
                }
                self.warnings.extend(warnings);
                self.logger.log_stage_passed(stage.as_str(), self.warnings.len());
                Ok(value)
            }
            Err(err) => {
                self.logger.log_stage_rejected(stage.as_str(), &err);
                Err(err)
            }
        }
    }

    /// Run and record a synchronous stage
    pub fn run<T, F>(&mut self, stage: Stage, f: F) -> StageResult<T>
    where
        F: FnOnce() -> StageResult<(T, Vec<Warning>)>,
    {
        let timer = Timer::new();
        let result = f();
        self.record(stage, timer, result)
    }

    pub fn finish(
        self,
        correlation_id: CorrelationId,
        kind: RequestKind,
        outcome: StageResult<SignedArtifact>,
    ) -> PipelineResult {
        match &outcome {
            Ok(_) => metrics()
                .pipeline_signed
                .with_label_values(&[kind.as_str()])
                .inc(),
            Err(err) => metrics()
                .pipeline_rejections
                .with_label_values(&[err.reason_code()])
                .inc(),
        }
        PipelineResult {
            correlation_id,
            kind,
            outcome,
            warnings: self.warnings,
            stages: self.stages,
        }
    }

    pub fn into_validation_report(self, outcome: StageResult<ValidatedRequest>) -> ValidationReport {
        let (request, error) = match outcome {
            Ok(request) => (Some(request), None),
            Err(err) => (None, Some(err)),
        };
        ValidationReport {
            valid: error.is_none(),
            reason_code: error.as_ref().map(PipelineError::reason_code),
            message: error.as_ref().map(|e| e.to_string()),
            request,
            warnings: self.warnings,
            stages: self.stages,
        }
    }
}
