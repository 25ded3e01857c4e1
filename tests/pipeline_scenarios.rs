//! End-to-end pipeline runs against mock collaborators

use signguard::config::Config;
use signguard::nonce_ledger::ConfirmationStatus;
use signguard::pipeline::testing::{MockSigner, ScriptedSimulator, StaticChainSource, StaticQuoteProvider};
use signguard::pipeline::{
    warning_codes, MediumRiskPolicy, MessageRequest, QuoteError, RiskLevel, SignerError,
    SimulationError, SimulationFallbackPolicy, SimulationOutcome, SigningPipeline,
    SigningPipelineBuilder, SigningRequest, Stage, TypedData, TypedDataRequest,
};
use signguard::types::{Address, ChainId};
use signguard::{DependencyRegistry, PipelineError};
use std::collections::BTreeSet;
use std::sync::Arc;

const ACCOUNT: &str = "0x1111111111111111111111111111111111111111";
const DEST: &str = "0x2222222222222222222222222222222222222222";
const BLOCKED: &str = "0x6666666666666666666666666666666666666666";
const CHAIN: ChainId = ChainId(1);

struct Harness {
    pipeline: SigningPipeline,
    signer: Arc<MockSigner>,
    simulator: Arc<ScriptedSimulator>,
}

fn account() -> Address {
    ACCOUNT.parse().unwrap()
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.risk.blocked_destinations = vec![BLOCKED.to_string()];
    config
}

fn harness_with(
    config: Config,
    customize: impl FnOnce(SigningPipelineBuilder) -> SigningPipelineBuilder,
) -> Harness {
    let registry = Arc::new(DependencyRegistry::new(&config));
    let signer = Arc::new(MockSigner::new(account(), CHAIN));
    let simulator = Arc::new(ScriptedSimulator::new());
    let builder = SigningPipeline::builder(registry, signer.clone(), simulator.clone()).config(&config);
    let pipeline = customize(builder).build().unwrap();
    Harness {
        pipeline,
        signer,
        simulator,
    }
}

fn harness() -> Harness {
    harness_with(base_config(), |b| b)
}

fn transfer() -> SigningRequest {
    SigningRequest::new(1, ACCOUNT).to(DEST).value("1000")
}

#[tokio::test]
async fn high_risk_is_blocked_before_any_nonce_is_reserved() {
    let h = harness();
    let result = h
        .pipeline
        .sign_transaction(SigningRequest::new(1, ACCOUNT).to(BLOCKED).value("1"))
        .await;

    assert!(matches!(
        result.error(),
        Some(PipelineError::RiskBlocked { level: RiskLevel::High, .. })
    ));
    assert_eq!(result.stages, vec![Stage::ChainMatch, Stage::RiskScreening]);
    assert!(h.pipeline.ledger().pending_nonces(account(), CHAIN).is_empty());
    assert_eq!(h.simulator.calls(), 0);
    assert_eq!(h.signer.calls(), 0);
}

#[tokio::test]
async fn signer_failure_releases_the_reserved_nonce() {
    let h = harness();
    h.pipeline.ledger().sync(account(), CHAIN, 3);
    h.signer.fail_with(SignerError::Rejected("user declined".to_string()));

    let result = h.pipeline.sign_transaction(transfer()).await;

    assert_eq!(result.reason_code(), Some("SIGNER_FAILURE"));
    assert_eq!(h.signer.last_transaction().unwrap().nonce, 3);
    let ledger = h.pipeline.ledger();
    assert!(!ledger.used_nonces(account(), CHAIN).contains(&3));
    assert!(!ledger.pending_nonces(account(), CHAIN).contains(&3));
    assert_eq!(ledger.next_nonce(account(), CHAIN), 3);
    assert!(result.warnings.iter().any(|w| w.code == warning_codes::GAS_ESTIMATED));
}

#[tokio::test]
async fn revert_releases_nonce_and_keeps_earlier_warnings() {
    let h = harness();
    h.simulator
        .push(Ok(SimulationOutcome::reverted("constructor reverted")));

    let result = h
        .pipeline
        .sign_transaction(SigningRequest::new(1, ACCOUNT).data("0x6080604052"))
        .await;

    assert_eq!(
        result.error(),
        Some(&PipelineError::reverted("constructor reverted"))
    );
    assert!(result.has_warning(warning_codes::RISK_LOW));
    assert_eq!(result.stages.last(), Some(&Stage::Simulation));
    assert!(h.pipeline.ledger().pending_nonces(account(), CHAIN).is_empty());
    assert_eq!(h.signer.calls(), 0);
}

#[tokio::test]
async fn chain_mismatch_stops_at_first_stage() {
    let h = harness();
    let result = h
        .pipeline
        .sign_transaction(SigningRequest::new(137, ACCOUNT).to(DEST))
        .await;
    assert_eq!(result.reason_code(), Some("CHAIN_MISMATCH"));
    assert_eq!(result.stages, vec![Stage::ChainMatch]);
    assert!(!result.error().unwrap().is_retryable());
}

#[tokio::test]
async fn concurrent_requests_get_distinct_nonces() {
    let h = harness();
    let runs = (0..5).map(|_| h.pipeline.sign_transaction(transfer()));
    let results = futures::future::join_all(runs).await;

    let nonces: BTreeSet<_> = results.iter().filter_map(|r| r.nonce()).collect();
    assert_eq!(nonces, (0..5).collect());
    assert_eq!(h.pipeline.ledger().pending_nonces(account(), CHAIN), nonces);
}

#[tokio::test]
async fn open_simulation_breaker_blocks_by_default() {
    let mut config = base_config();
    config.breakers.default.failure_threshold = 1;
    let h = harness_with(config, |b| b);
    h.simulator
        .push(Err(SimulationError::Network("connection reset".to_string())));

    let first = h.pipeline.sign_transaction(transfer()).await;
    assert_eq!(first.reason_code(), Some("DEPENDENCY_UNAVAILABLE"));

    let second = h.pipeline.sign_transaction(transfer()).await;
    assert_eq!(second.reason_code(), Some("DEPENDENCY_UNAVAILABLE"));
    assert!(second.error().unwrap().is_retryable());
    assert_eq!(h.simulator.calls(), 1);
    assert!(h.pipeline.ledger().pending_nonces(account(), CHAIN).is_empty());
}

#[tokio::test]
async fn estimate_only_fallback_signs_with_warning() {
    let mut config = base_config();
    config.breakers.default.failure_threshold = 1;
    config.pipeline.simulation_fallback = SimulationFallbackPolicy::EstimateOnly;
    let source = Arc::new(StaticChainSource::new(0).with_gas_estimate(30_000));
    let h = harness_with(config, |b| b.chain_source(source));
    h.simulator
        .push(Err(SimulationError::Timeout(2_000)));

    let first = h.pipeline.sign_transaction(transfer()).await;
    assert_eq!(first.reason_code(), Some("DEPENDENCY_UNAVAILABLE"));

    let second = h.pipeline.sign_transaction(transfer()).await;
    assert!(second.is_signed(), "{:?}", second.error());
    assert!(second.has_warning(warning_codes::SIMULATION_SKIPPED));
    assert_eq!(h.signer.last_transaction().unwrap().gas_limit, Some(36_000));
}

#[tokio::test]
async fn cancellation_after_reservation_releases_nonce() {
    let h = harness();
    h.signer.hang();

    let signer = h.signer.clone();
    let result = h
        .pipeline
        .sign_transaction_until(transfer(), async move { signer.wait_until_called().await })
        .await;

    assert_eq!(result.error(), Some(&PipelineError::Cancelled));
    assert!(result.stages.contains(&Stage::NonceAssignment));
    assert!(!result.stages.contains(&Stage::Signature));
    assert!(h.pipeline.ledger().pending_nonces(account(), CHAIN).is_empty());
}

#[tokio::test]
async fn message_signing_runs_reduced_pipeline() {
    let h = harness();
    let result = h
        .pipeline
        .sign_message(MessageRequest {
            chain_id: 1,
            account: ACCOUNT.to_string(),
            message: "Sign in to Market".to_string(),
            risk_acknowledged: false,
        })
        .await;

    assert!(result.is_signed());
    assert_eq!(
        result.stages,
        vec![Stage::ChainMatch, Stage::RiskScreening, Stage::Signature]
    );
    assert!(result.artifact().unwrap().tx_hash.is_none());
    assert!(h.pipeline.ledger().is_empty());
}

#[tokio::test]
async fn message_with_broken_hex_is_rejected_unsigned() {
    let h = harness();
    let result = h
        .pipeline
        .sign_message(MessageRequest {
            chain_id: 1,
            account: ACCOUNT.to_string(),
            message: "0xdeadbeefz".to_string(),
            risk_acknowledged: false,
        })
        .await;

    assert_eq!(result.reason_code(), Some("MALFORMED_REQUEST"));
    assert_eq!(result.stages, vec![Stage::ChainMatch, Stage::RiskScreening]);
    assert_eq!(h.signer.calls(), 0);
}

#[tokio::test]
async fn blind_hash_needs_acknowledgment_under_ack_policy() {
    let mut config = base_config();
    config.pipeline.medium_risk_policy = MediumRiskPolicy::RequireAcknowledgment;
    let h = harness_with(config, |b| b);
    let hash = format!("0x{}", "fe".repeat(32));
    let request = MessageRequest {
        chain_id: 1,
        account: ACCOUNT.to_string(),
        message: hash,
        risk_acknowledged: false,
    };

    let refused = h.pipeline.sign_message(request.clone()).await;
    assert_eq!(refused.reason_code(), Some("RISK_BLOCKED"));

    let accepted = h
        .pipeline
        .sign_message(MessageRequest {
            risk_acknowledged: true,
            ..request
        })
        .await;
    assert!(accepted.is_signed());
    assert!(accepted.has_warning(warning_codes::RISK_ACKNOWLEDGED));
}

#[tokio::test]
async fn typed_data_domain_must_match_chain() {
    let h = harness();
    let typed_data: TypedData = serde_json::from_value(serde_json::json!({
        "domain": {"name": "Market", "chainId": 137},
        "types": {"Order": [{"name": "price", "type": "uint256"}]},
        "primaryType": "Order",
        "message": {"price": "1"}
    }))
    .unwrap();

    let result = h
        .pipeline
        .sign_typed_data(TypedDataRequest {
            chain_id: 1,
            account: ACCOUNT.to_string(),
            typed_data,
            risk_acknowledged: false,
        })
        .await;

    assert_eq!(result.reason_code(), Some("CHAIN_MISMATCH"));
    assert_eq!(h.signer.calls(), 0);
}

#[tokio::test]
async fn quote_failure_degrades_to_stale_warning() {
    let provider = Arc::new(StaticQuoteProvider::new(2_000.0));
    let h = harness_with(base_config(), |b| b.quote_provider(provider.clone()));

    let fresh = h
        .pipeline
        .sign_transaction(transfer().quote_pair("ETH/USD"))
        .await;
    assert!(fresh.is_signed());
    assert!(fresh.stages.contains(&Stage::QuoteFetch));
    assert!(!fresh.artifact().unwrap().quote.as_ref().unwrap().stale);

    provider.fail_with(QuoteError::Timeout(1_000));
    let stale = h
        .pipeline
        .sign_transaction(transfer().quote_pair("ETH/USD"))
        .await;
    assert!(stale.is_signed());
    assert!(stale.has_warning(warning_codes::QUOTE_STALE));
    assert_eq!(stale.artifact().unwrap().quote.as_ref().unwrap().price, 2_000.0);

    let unknown = h
        .pipeline
        .sign_transaction(transfer().quote_pair("BTC/USD"))
        .await;
    assert!(unknown.is_signed());
    assert!(unknown.has_warning(warning_codes::QUOTE_UNAVAILABLE));
}

#[tokio::test]
async fn committed_nonce_is_confirmed_by_tracker() {
    let source = Arc::new(StaticChainSource::new(0));
    let h = harness_with(base_config(), |b| b.chain_source(source));

    let result = h.pipeline.sign_transaction(transfer()).await;
    let artifact = result.artifact().unwrap();
    let nonce = result.nonce().unwrap();

    let tracker = h.pipeline.confirmation_tracker().unwrap();
    let status = tracker
        .track(account(), CHAIN, nonce, artifact.tx_hash.unwrap())
        .await;

    assert!(matches!(status, ConfirmationStatus::Confirmed(_)));
    let ledger = h.pipeline.ledger();
    assert!(ledger.used_nonces(account(), CHAIN).contains(&nonce));
    assert!(ledger.pending_nonces(account(), CHAIN).is_empty());
    assert_eq!(ledger.next_nonce(account(), CHAIN), nonce + 1);
}

#[tokio::test]
async fn report_serializes_outcome() {
    let h = harness();
    let result = h.pipeline.sign_transaction(transfer().gas_limit("lots")).await;
    let report = serde_json::to_value(result.report()).unwrap();
    assert_eq!(report["signed"], false);
    assert_eq!(report["reason_code"], "INVALID_GAS_PARAMETERS");
    assert_eq!(report["stages"].as_array().unwrap().len(), 4);
}
