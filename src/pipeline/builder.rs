//! Signing pipeline orchestrator
//!
//! Runs a request through the ordered stages, reserving a nonce from the
//! shared ledger before simulation and settling it on every exit path:
//! committed when a signature is returned, released on any later failure or
//! when the run is cancelled.

use crate::chain_source::ChainTruthSource;
use crate::circuit_breaker::{BreakerError, Dependency, DependencyRegistry};
use crate::config::{Config, ConfigError, GasConfig, PipelineConfig, RiskConfig};
use crate::errors::{PipelineError, StageResult};
use crate::metrics::{metrics, Timer};
use crate::nonce_ledger::{ConfirmationTracker, NonceLedger};
use crate::observability::{CorrelationId, TraceContext};
use crate::pipeline::output::{
    warning_codes, PipelineResult, RequestKind, RunTrace, SignedArtifact, ValidationReport, Warning,
};
use crate::pipeline::quote::{Quote, QuotePair, QuoteProvider, QuoteService};
use crate::pipeline::request::{MessageRequest, SigningRequest, TransactionFields, TypedDataRequest};
use crate::pipeline::risk::{RiskScreener, RuleRiskScreener};
use crate::pipeline::signer::{ExternalSigner, SignerError};
use crate::pipeline::simulate::{estimate_only, SimulationFallbackPolicy, SimulationOutcome, Simulator};
use crate::pipeline::stages::{
    apply_risk_policy, apply_simulation, check_identity, run_local_stages, Identity, LocalContext,
    Stage,
};
use crate::structured_logging::StructuredLogger;
use crate::types::{ChainId, SignatureBytes, TxHash};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, Instrument};

pub struct SigningPipeline {
    registry: Arc<DependencyRegistry>,
    signer: Arc<dyn ExternalSigner>,
    simulator: Arc<dyn Simulator>,
    screener: Arc<dyn RiskScreener>,
    chain_source: Option<Arc<dyn ChainTruthSource>>,
    quotes: Option<QuoteService>,
    settings: PipelineConfig,
    gas: GasConfig,
}

pub struct SigningPipelineBuilder {
    registry: Arc<DependencyRegistry>,
    signer: Arc<dyn ExternalSigner>,
    simulator: Arc<dyn Simulator>,
    screener: Option<Arc<dyn RiskScreener>>,
    chain_source: Option<Arc<dyn ChainTruthSource>>,
    quote_provider: Option<Arc<dyn QuoteProvider>>,
    settings: PipelineConfig,
    risk: RiskConfig,
    gas: GasConfig,
}

impl SigningPipelineBuilder {
    /// Take pipeline, risk and gas settings from `config`
    pub fn config(mut self, config: &Config) -> Self {
        self.settings = config.pipeline.clone();
        self.risk = config.risk.clone();
        self.gas = config.gas.clone();
        self
    }

    /// Replace the rule-based screener
    pub fn screener(mut self, screener: Arc<dyn RiskScreener>) -> Self {
        self.screener = Some(screener);
        self
    }

    pub fn chain_source(mut self, source: Arc<dyn ChainTruthSource>) -> Self {
        self.chain_source = Some(source);
        self
    }

    pub fn quote_provider(mut self, provider: Arc<dyn QuoteProvider>) -> Self {
        self.quote_provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<SigningPipeline, ConfigError> {
        if let Some(expected) = self.settings.chain_id {
            let connected = self.signer.chain_id();
            if connected != ChainId(expected) {
                return Err(ConfigError::Invalid(format!(
                    "signer is connected to chain {} but pipeline.chain_id is {}",
                    connected, expected
                )));
            }
        }
        if self.settings.simulation_fallback == SimulationFallbackPolicy::EstimateOnly
            && self.chain_source.is_none()
        {
            tracing::warn!("estimate_only simulation fallback configured without a chain source; open breaker will block");
        }

        let screener = self
            .screener
            .unwrap_or_else(|| Arc::new(RuleRiskScreener::from_config(&self.risk)));
        let quotes = self
            .quote_provider
            .map(|provider| QuoteService::new(provider, self.registry.breaker(Dependency::Quote)));

        Ok(SigningPipeline {
            registry: self.registry,
            signer: self.signer,
            simulator: self.simulator,
            screener,
            chain_source: self.chain_source,
            quotes,
            settings: self.settings,
            gas: self.gas,
        })
    }
}

fn transaction_hash(fields: &TransactionFields, signature: &SignatureBytes) -> TxHash {
    let mut hasher = Sha256::new();
    hasher.update(fields.encode());
    hasher.update(&signature.0);
    TxHash(hasher.finalize().into())
}

impl SigningPipeline {
    pub fn builder(
        registry: Arc<DependencyRegistry>,
        signer: Arc<dyn ExternalSigner>,
        simulator: Arc<dyn Simulator>,
    ) -> SigningPipelineBuilder {
        SigningPipelineBuilder {
            registry,
            signer,
            simulator,
            screener: None,
            chain_source: None,
            quote_provider: None,
            settings: PipelineConfig::default(),
            risk: RiskConfig::default(),
            gas: GasConfig::default(),
        }
    }

    /// Ledger shared with every pipeline built on the same registry
    pub fn ledger(&self) -> Arc<NonceLedger> {
        self.registry.ledger()
    }

    pub fn registry(&self) -> &Arc<DependencyRegistry> {
        &self.registry
    }

    /// Tracker that settles committed nonces, when a chain source is set
    pub fn confirmation_tracker(&self) -> Option<ConfirmationTracker> {
        self.chain_source
            .as_ref()
            .map(|source| ConfirmationTracker::new(self.ledger(), Arc::clone(source)))
    }

    fn local_context(&self) -> LocalContext<'_> {
        LocalContext {
            connected_chain: self.signer.chain_id(),
            signer_account: self.signer.account(),
            screener: self.screener.as_ref(),
            medium_risk_policy: self.settings.medium_risk_policy,
            gas: &self.gas,
        }
    }

    fn start(&self, kind: RequestKind, account: &str, chain_id: u64, payload_len: usize) -> (TraceContext, RunTrace) {
        metrics()
            .pipeline_requests
            .with_label_values(&[kind.as_str()])
            .inc();
        let ctx = TraceContext::new(kind.as_str(), CorrelationId::new()).for_request(account, chain_id);
        let logger = StructuredLogger::new(ctx.correlation_id().clone());
        logger.log_request_received(kind.as_str(), account, chain_id, payload_len);
        (ctx, RunTrace::new(logger))
    }

    // ========================================================================
    // VALIDATION ONLY
    // ========================================================================

    /// Run stages 1-4 without touching the ledger or the network
    pub fn validate(&self, request: &SigningRequest) -> ValidationReport {
        let logger = StructuredLogger::new(CorrelationId::new());
        let mut run = RunTrace::new(logger);
        let outcome = run_local_stages(&self.local_context(), request, &mut run);
        run.into_validation_report(outcome)
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    pub async fn sign_transaction(&self, request: SigningRequest) -> PipelineResult {
        self.sign_transaction_until(request, futures::future::pending())
            .await
    }

    /// Like [`SigningPipeline::sign_transaction`], but stops with
    /// `Cancelled` as soon as `cancel` resolves
    ///
    /// A nonce reserved before cancellation is released.
    pub async fn sign_transaction_until<C>(&self, request: SigningRequest, cancel: C) -> PipelineResult
    where
        C: Future<Output = ()>,
    {
        let payload_len = request.data.len().saturating_sub(2) / 2;
        let (ctx, mut run) = self.start(
            RequestKind::Transaction,
            &request.account,
            request.chain_id,
            payload_len,
        );
        let started = Timer::new();

        let outcome = async {
            tokio::select! {
                outcome = self.transaction_stages(&ctx, &request, &mut run) => outcome,
                _ = cancel => Err(PipelineError::Cancelled),
            }
        }
        .instrument(ctx.span())
        .await;

        if let Ok(artifact) = &outcome {
            run.logger().log_signed(
                RequestKind::Transaction.as_str(),
                artifact.signature.len(),
                (started.elapsed_secs() * 1000.0) as u64,
            );
        }
        run.finish(ctx.correlation_id().clone(), RequestKind::Transaction, outcome)
    }

    async fn transaction_stages(
        &self,
        ctx: &TraceContext,
        request: &SigningRequest,
        run: &mut RunTrace,
    ) -> StageResult<SignedArtifact> {
        let validated = run_local_stages(&self.local_context(), request, run)?;
        let Identity { account, chain_id } = validated.identity;

        // Stage 5
        let timer = Timer::new();
        let reserved = self
            .ledger()
            .reserve_next(account, chain_id)
            .await
            .map(|reservation| (reservation, Vec::new()))
            .map_err(PipelineError::from);
        let reservation = run.record(Stage::NonceAssignment, timer, reserved)?;
        let nonce = reservation.nonce();
        run.logger().log_nonce_operation("reserve", account, chain_id, nonce);

        // Stage 6
        let fields = validated.into_fields(nonce);
        let timer = Timer::new();
        let outcome = self
            .simulate(&fields)
            .instrument(ctx.stage_span(Stage::Simulation.as_str()))
            .await;
        let simulated = match outcome {
            Ok(outcome) => apply_simulation(
                outcome,
                fields,
                self.settings.gas_headroom_percent,
                self.settings.high_cost_warning_wei(),
            ),
            Err(err) => Err(err),
        };
        let fields = match run.record(Stage::Simulation, timer, simulated) {
            Ok(fields) => fields,
            Err(err) => {
                reservation.release();
                run.logger().log_nonce_operation("release", account, chain_id, nonce);
                return Err(err);
            }
        };

        let quote = match &request.quote_pair {
            Some(pair) => {
                self.fetch_quote(pair, run)
                    .instrument(ctx.stage_span(Stage::QuoteFetch.as_str()))
                    .await
            }
            None => None,
        };

        // Stage 7
        let timer = Timer::new();
        let signed = self.signer.sign_transaction(&fields, chain_id).await;
        timer.observe_duration(&metrics().signing_latency);
        let signed = signed
            .map(|signature| (signature, Vec::new()))
            .map_err(PipelineError::from);
        let signature = match run.record(Stage::Signature, timer, signed) {
            Ok(signature) => signature,
            Err(err) => {
                reservation.release();
                run.logger().log_nonce_operation("release", account, chain_id, nonce);
                return Err(err);
            }
        };

        reservation.commit();
        run.logger().log_nonce_operation("commit", account, chain_id, nonce);
        Ok(SignedArtifact {
            tx_hash: Some(transaction_hash(&fields, &signature)),
            signature,
            transaction: Some(fields),
            quote,
        })
    }

    /// Dry run through the `Simulation` breaker
    async fn simulate(&self, fields: &TransactionFields) -> StageResult<SimulationOutcome> {
        let breaker = self.registry.breaker(Dependency::Simulation);
        let timer = Timer::new();
        let result = match (self.settings.simulation_fallback, &self.chain_source) {
            (SimulationFallbackPolicy::EstimateOnly, Some(source)) => {
                breaker
                    .execute_with_fallback(
                        || self.simulator.simulate(fields),
                        || estimate_only(source.as_ref(), fields),
                    )
                    .await
            }
            _ => breaker.execute(|| self.simulator.simulate(fields)).await,
        };
        timer.observe_duration(&metrics().simulation_latency);

        result.map_err(|err| match err {
            BreakerError::Unavailable { dependency, state } => {
                PipelineError::unavailable(dependency, Some(format!("circuit {}", state)))
            }
            BreakerError::Operation(err) | BreakerError::Fallback(err) => {
                PipelineError::unavailable(breaker.name(), Some(err.to_string()))
            }
        })
    }

    /// Informational price lookup; every failure becomes a warning
    async fn fetch_quote(&self, raw_pair: &str, run: &mut RunTrace) -> Option<Quote> {
        let timer = Timer::new();
        let (quote, warnings) = match (raw_pair.parse::<QuotePair>(), &self.quotes) {
            (Err(err), _) => (
                None,
                vec![Warning::new(Stage::QuoteFetch, warning_codes::QUOTE_UNAVAILABLE, err)],
            ),
            (Ok(pair), None) => (
                None,
                vec![Warning::new(
                    Stage::QuoteFetch,
                    warning_codes::QUOTE_UNAVAILABLE,
                    format!("no quote provider configured for {}", pair),
                )],
            ),
            (Ok(pair), Some(service)) => match service.get_quote(&pair).await {
                Ok(quote) if quote.stale => {
                    let warning = Warning::new(
                        Stage::QuoteFetch,
                        warning_codes::QUOTE_STALE,
                        format!("{} quote from {} is stale", pair, quote.fetched_at.to_rfc3339()),
                    );
                    (Some(quote), vec![warning])
                }
                Ok(quote) => (Some(quote), Vec::new()),
                Err(err) => (
                    None,
                    vec![Warning::new(
                        Stage::QuoteFetch,
                        warning_codes::QUOTE_UNAVAILABLE,
                        err.to_string(),
                    )],
                ),
            },
        };
        run.record(Stage::QuoteFetch, timer, Ok((quote, warnings)))
            .unwrap_or_default()
    }

    // ========================================================================
    // MESSAGES AND TYPED DATA
    // ========================================================================

    /// Reduced pipeline: identity, risk, signature
    pub async fn sign_message(&self, request: MessageRequest) -> PipelineResult {
        let (ctx, mut run) = self.start(
            RequestKind::Message,
            &request.account,
            request.chain_id,
            request.message.len(),
        );

        let outcome = async {
            run.run(Stage::ChainMatch, || {
                check_identity(
                    request.chain_id,
                    &request.account,
                    self.signer.chain_id(),
                    self.signer.account(),
                )
            })?;
            // Undecodable hex stops the run at screening
            let message = run.run(Stage::RiskScreening, || {
                let message = request.message_bytes()?;
                let ((), warnings) = apply_risk_policy(
                    self.screener.classify_message(&message),
                    request.risk_acknowledged,
                    self.settings.medium_risk_policy,
                )?;
                Ok((message, warnings))
            })?;
            let signed = self.signer.sign_message(&message).await;
            self.record_signature(&mut run, RequestKind::Message, signed)
        }
        .instrument(ctx.span())
        .await;

        run.finish(ctx.correlation_id().clone(), RequestKind::Message, outcome)
    }

    /// Reduced pipeline; a domain `chainId` must match the connected chain
    pub async fn sign_typed_data(&self, request: TypedDataRequest) -> PipelineResult {
        let typed_data = &request.typed_data;
        let (ctx, mut run) = self.start(
            RequestKind::TypedData,
            &request.account,
            request.chain_id,
            typed_data.canonical_bytes().len(),
        );

        let outcome = async {
            run.run(Stage::ChainMatch, || {
                let connected = self.signer.chain_id();
                let checked = check_identity(
                    request.chain_id,
                    &request.account,
                    connected,
                    self.signer.account(),
                )?;
                match typed_data.domain_chain_id() {
                    Some(Err(reason)) => {
                        Err(PipelineError::malformed("typed_data.domain.chainId", reason))
                    }
                    Some(Ok(domain_chain)) if ChainId(domain_chain) != connected => {
                        Err(PipelineError::ChainMismatch {
                            requested: ChainId(domain_chain),
                            connected,
                        })
                    }
                    _ => Ok(checked),
                }
            })?;
            run.run(Stage::RiskScreening, || {
                apply_risk_policy(
                    self.screener.classify_typed_data(typed_data),
                    request.risk_acknowledged,
                    self.settings.medium_risk_policy,
                )
            })?;
            let signed = self.signer.sign_typed_data(typed_data).await;
            self.record_signature(&mut run, RequestKind::TypedData, signed)
        }
        .instrument(ctx.span())
        .await;

        run.finish(ctx.correlation_id().clone(), RequestKind::TypedData, outcome)
    }

    fn record_signature(
        &self,
        run: &mut RunTrace,
        kind: RequestKind,
        signed: Result<SignatureBytes, SignerError>,
    ) -> StageResult<SignedArtifact> {
        let timer = Timer::new();
        let signed = signed
            .map(|signature| (signature, Vec::new()))
            .map_err(PipelineError::from);
        let signature = run.record(Stage::Signature, timer, signed)?;
        debug!(kind = kind.as_str(), "Signature produced");
        Ok(SignedArtifact {
            signature,
            tx_hash: None,
            transaction: None,
            quote: None,
        })
    }
}

impl std::fmt::Debug for SigningPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningPipeline")
            .field("account", &self.signer.account())
            .field("chain_id", &self.signer.chain_id())
            .field("simulation_fallback", &self.settings.simulation_fallback)
            .field("quotes", &self.quotes.is_some())
            .finish()
    }
}
