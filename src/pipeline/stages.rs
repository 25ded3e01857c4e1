//! Pipeline stages
//!
//! Every stage here is a pure function of the request and its context that
//! returns either a value plus warnings or a terminal [`PipelineError`].
//! Nonce assignment and the network stages live on the pipeline itself.

use crate::config::GasConfig;
use crate::errors::{PipelineError, StageResult};
use crate::pipeline::output::{warning_codes, RunTrace, Warning};
use crate::pipeline::request::{GasFields, GasPricing, SigningRequest, TransactionFields};
use crate::pipeline::risk::{MediumRiskPolicy, RiskAssessment, RiskLevel, RiskScreener};
use crate::pipeline::simulate::SimulationOutcome;
use crate::pipeline::validators::{parse_address, parse_gas_quantity, parse_hex_bytes, parse_quantity};
use crate::types::{Address, ChainId};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ChainMatch,
    RiskScreening,
    ShapeValidation,
    GasValidation,
    NonceAssignment,
    Simulation,
    QuoteFetch,
    Signature,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ChainMatch => "chain_match",
            Stage::RiskScreening => "risk_screening",
            Stage::ShapeValidation => "shape_validation",
            Stage::GasValidation => "gas_validation",
            Stage::NonceAssignment => "nonce_assignment",
            Stage::Simulation => "simulation",
            Stage::QuoteFetch => "quote_fetch",
            Stage::Signature => "signature",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chain and account confirmed by stage 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub chain_id: ChainId,
    pub account: Address,
}

/// Parsed destination, value and payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shape {
    pub to: Option<Address>,
    pub value: u128,
    #[serde(serialize_with = "hex_payload")]
    pub data: Vec<u8>,
}

fn hex_payload<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GasSettings {
    pub gas_limit: Option<u64>,
    pub pricing: Option<GasPricing>,
}

/// Output of the local stages (1-4)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedRequest {
    pub identity: Identity,
    pub shape: Shape,
    pub gas: GasSettings,
}

impl ValidatedRequest {
    pub fn into_fields(self, nonce: crate::types::Nonce) -> TransactionFields {
        TransactionFields {
            chain_id: self.identity.chain_id,
            from: self.identity.account,
            to: self.shape.to,
            value: self.shape.value,
            data: self.shape.data,
            nonce,
            gas_limit: self.gas.gas_limit,
            pricing: self.gas.pricing,
        }
    }
}

/// Collaborators and policy the local stages need
#[derive(Clone, Copy)]
pub struct LocalContext<'a> {
    pub connected_chain: ChainId,
    pub signer_account: Address,
    pub screener: &'a dyn RiskScreener,
    pub medium_risk_policy: MediumRiskPolicy,
    pub gas: &'a GasConfig,
}

// ============================================================================
// STAGE 1: CHAIN AND ACCOUNT MATCH
// ============================================================================

pub fn check_identity(
    chain_id: u64,
    account: &str,
    connected_chain: ChainId,
    signer_account: Address,
) -> StageResult<(Identity, Vec<Warning>)> {
    if chain_id == 0 {
        return Err(PipelineError::malformed("chain_id", "must be non-zero"));
    }
    let requested = ChainId(chain_id);
    if requested != connected_chain {
        return Err(PipelineError::ChainMismatch {
            requested,
            connected: connected_chain,
        });
    }
    let account = parse_address("account", account)?;
    if account != signer_account {
        return Err(PipelineError::AccountMismatch {
            requested: account,
            signer: signer_account,
        });
    }
    Ok((
        Identity {
            chain_id: requested,
            account,
        },
        Vec::new(),
    ))
}

// ============================================================================
// STAGE 2: RISK SCREENING
// ============================================================================

/// Best-effort view of the request for screening
///
/// Risk runs before shape validation, so unparseable fields are screened as
/// absent here and rejected by stage 3.
pub fn risk_inputs(request: &SigningRequest) -> (Option<Address>, u128, Vec<u8>) {
    let to = request.to.as_deref().and_then(|s| s.trim().parse().ok());
    let value = parse_quantity("value", &request.value).unwrap_or(0);
    let data = parse_hex_bytes("data", &request.data).unwrap_or_default();
    (to, value, data)
}

/// Turn a screener verdict into warnings or a rejection
pub fn apply_risk_policy(
    assessment: RiskAssessment,
    acknowledged: bool,
    policy: MediumRiskPolicy,
) -> StageResult<((), Vec<Warning>)> {
    let RiskAssessment { level, reasons } = assessment;
    let blocked = |reasons: Vec<String>| PipelineError::RiskBlocked { level, reasons };

    match level {
        RiskLevel::High => Err(blocked(reasons)),
        RiskLevel::Medium => match policy {
            MediumRiskPolicy::Block => Err(blocked(reasons)),
            MediumRiskPolicy::RequireAcknowledgment if !acknowledged => {
                let mut reasons = reasons;
                reasons.push("acknowledgment required".to_string());
                Err(blocked(reasons))
            }
            MediumRiskPolicy::RequireAcknowledgment => {
                let warnings = reasons
                    .into_iter()
                    .map(|r| Warning::new(Stage::RiskScreening, warning_codes::RISK_ACKNOWLEDGED, r))
                    .collect();
                Ok(((), warnings))
            }
        },
        RiskLevel::Low | RiskLevel::None => {
            let warnings = reasons
                .into_iter()
                .map(|r| Warning::new(Stage::RiskScreening, warning_codes::RISK_LOW, r))
                .collect();
            Ok(((), warnings))
        }
    }
}

pub fn screen_risk(
    request: &SigningRequest,
    screener: &dyn RiskScreener,
    policy: MediumRiskPolicy,
) -> StageResult<((), Vec<Warning>)> {
    let (to, value, data) = risk_inputs(request);
    let assessment = screener.classify(to.as_ref(), value, &data);
    apply_risk_policy(assessment, request.risk_acknowledged, policy)
}

// ============================================================================
// STAGE 3: SHAPE VALIDATION
// ============================================================================

pub fn validate_shape(request: &SigningRequest) -> StageResult<(Shape, Vec<Warning>)> {
    let to = match request.to.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(parse_address("to", raw)?),
        _ => None,
    };
    let value = parse_quantity("value", &request.value)?;
    let data = parse_hex_bytes("data", &request.data)?;

    if to.is_none() && data.is_empty() {
        return Err(PipelineError::malformed(
            "to",
            "contract creation requires a payload",
        ));
    }

    let mut warnings = Vec::new();
    if to.is_some() && !data.is_empty() && data.len() < 4 {
        warnings.push(Warning::new(
            Stage::ShapeValidation,
            warning_codes::PAYLOAD_SHORT,
            format!("payload of {} bytes is shorter than a function selector", data.len()),
        ));
    }
    Ok((Shape { to, value, data }, warnings))
}

// ============================================================================
// STAGE 4: GAS VALIDATION
// ============================================================================

fn check_fee(field: &str, fee: u128, config: &GasConfig, warnings: &mut Vec<Warning>) -> StageResult<()> {
    if fee == 0 {
        return Err(PipelineError::invalid_gas(format!("{} must be greater than zero", field)));
    }
    if fee > config.max_fee_wei() {
        return Err(PipelineError::invalid_gas(format!(
            "{} of {} wei exceeds the cap of {} gwei",
            field, fee, config.max_fee_gwei
        )));
    }
    if fee > config.warn_fee_wei() {
        warnings.push(Warning::new(
            Stage::GasValidation,
            warning_codes::FEE_HIGH,
            format!("{} is above {} gwei", field, config.warn_fee_gwei),
        ));
    }
    Ok(())
}

pub fn validate_gas(
    gas: &GasFields,
    has_payload: bool,
    config: &GasConfig,
) -> StageResult<(GasSettings, Vec<Warning>)> {
    let mut warnings = Vec::new();

    let legacy = gas.gas_price.is_some();
    let fee_market = gas.max_fee_per_gas.is_some() || gas.max_priority_fee_per_gas.is_some();
    if legacy && fee_market {
        return Err(PipelineError::invalid_gas(
            "gas_price cannot be combined with fee-market fields",
        ));
    }

    let gas_limit = match &gas.gas_limit {
        Some(raw) => {
            let limit = parse_gas_quantity("gas_limit", raw)?;
            let limit = u64::try_from(limit)
                .map_err(|_| PipelineError::invalid_gas("gas_limit out of range"))?;
            if limit < config.min_gas_limit || limit > config.max_gas_limit {
                return Err(PipelineError::invalid_gas(format!(
                    "gas_limit {} outside [{}, {}]",
                    limit, config.min_gas_limit, config.max_gas_limit
                )));
            }
            if limit > config.warn_gas_limit {
                warnings.push(Warning::new(
                    Stage::GasValidation,
                    warning_codes::GAS_LIMIT_HIGH,
                    format!("gas_limit {} is unusually high", limit),
                ));
            }
            if has_payload && limit == config.min_gas_limit {
                warnings.push(Warning::new(
                    Stage::GasValidation,
                    warning_codes::GAS_LIMIT_TIGHT,
                    "contract call with the minimum gas limit will likely run out of gas",
                ));
            }
            Some(limit)
        }
        None => None,
    };

    let pricing = if let Some(raw) = &gas.gas_price {
        let gas_price = parse_gas_quantity("gas_price", raw)?;
        check_fee("gas_price", gas_price, config, &mut warnings)?;
        Some(GasPricing::Legacy { gas_price })
    } else if fee_market {
        let (max_fee, priority_fee) = match (&gas.max_fee_per_gas, &gas.max_priority_fee_per_gas) {
            (Some(max), Some(priority)) => (
                parse_gas_quantity("max_fee_per_gas", max)?,
                parse_gas_quantity("max_priority_fee_per_gas", priority)?,
            ),
            _ => {
                return Err(PipelineError::invalid_gas(
                    "max_fee_per_gas and max_priority_fee_per_gas must be given together",
                ))
            }
        };
        check_fee("max_fee_per_gas", max_fee, config, &mut warnings)?;
        if priority_fee > max_fee {
            return Err(PipelineError::invalid_gas(format!(
                "max_priority_fee_per_gas {} exceeds max_fee_per_gas {}",
                priority_fee, max_fee
            )));
        }
        Some(GasPricing::FeeMarket {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority_fee,
        })
    } else {
        None
    };

    Ok((GasSettings { gas_limit, pricing }, warnings))
}

// ============================================================================
// LOCAL STAGE CHAIN
// ============================================================================

/// Run stages 1-4 in order, stopping at the first rejection
pub fn run_local_stages(
    ctx: &LocalContext<'_>,
    request: &SigningRequest,
    run: &mut RunTrace,
) -> StageResult<ValidatedRequest> {
    let identity = run.run(Stage::ChainMatch, || {
        check_identity(
            request.chain_id,
            &request.account,
            ctx.connected_chain,
            ctx.signer_account,
        )
    })?;
    run.run(Stage::RiskScreening, || {
        screen_risk(request, ctx.screener, ctx.medium_risk_policy)
    })?;
    let shape = run.run(Stage::ShapeValidation, || validate_shape(request))?;
    let gas = run.run(Stage::GasValidation, || {
        validate_gas(&request.gas, !shape.data.is_empty(), ctx.gas)
    })?;
    Ok(ValidatedRequest {
        identity,
        shape,
        gas,
    })
}

// ============================================================================
// SIMULATION RESULT HANDLING
// ============================================================================

/// Fold a simulation outcome into the transaction
///
/// A revert is fatal. Without a caller-supplied gas limit the estimate plus
/// `headroom_percent` becomes the limit.
pub fn apply_simulation(
    outcome: SimulationOutcome,
    mut fields: TransactionFields,
    headroom_percent: u64,
    high_cost_warning_wei: u128,
) -> StageResult<(TransactionFields, Vec<Warning>)> {
    if !outcome.success {
        return Err(PipelineError::reverted(
            outcome
                .revert_reason
                .unwrap_or_else(|| "execution reverted".to_string()),
        ));
    }

    let mut warnings: Vec<Warning> = outcome
        .warnings
        .into_iter()
        .map(|w| Warning::new(Stage::Simulation, warning_codes::SIMULATION_NOTE, w))
        .collect();

    if !outcome.simulated {
        warnings.push(Warning::new(
            Stage::Simulation,
            warning_codes::SIMULATION_SKIPPED,
            "simulation unavailable; proceeding on a gas estimate only",
        ));
    }

    match fields.gas_limit {
        Some(limit) if outcome.gas_estimate > limit => {
            return Err(PipelineError::invalid_gas(format!(
                "gas_limit {} is below the simulated usage of {}",
                limit, outcome.gas_estimate
            )));
        }
        Some(_) => {}
        None => {
            if outcome.gas_estimate == 0 {
                return Err(PipelineError::invalid_gas(
                    "no gas_limit given and the simulation returned no estimate",
                ));
            }
            let limit = outcome
                .gas_estimate
                .saturating_mul(100 + headroom_percent)
                / 100;
            warnings.push(Warning::new(
                Stage::Simulation,
                warning_codes::GAS_ESTIMATED,
                format!("gas_limit set to {} from an estimate of {}", limit, outcome.gas_estimate),
            ));
            fields.gas_limit = Some(limit);
        }
    }

    if outcome.estimated_cost_wei > high_cost_warning_wei {
        warnings.push(Warning::new(
            Stage::Simulation,
            warning_codes::SIMULATION_HIGH_COST,
            format!("estimated cost of {} wei is unusually high", outcome.estimated_cost_wei),
        ));
    }

    Ok((fields, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::risk::RuleRiskScreener;

    const ACCOUNT: &str = "0x1111111111111111111111111111111111111111";
    const DEST: &str = "0x2222222222222222222222222222222222222222";

    fn account() -> Address {
        ACCOUNT.parse().unwrap()
    }

    #[test]
    fn test_identity_checks() {
        assert!(check_identity(1, ACCOUNT, ChainId(1), account()).is_ok());

        let err = check_identity(137, ACCOUNT, ChainId(1), account()).unwrap_err();
        assert_eq!(err.reason_code(), "CHAIN_MISMATCH");

        let err = check_identity(1, DEST, ChainId(1), account()).unwrap_err();
        assert_eq!(err.reason_code(), "ACCOUNT_MISMATCH");

        let err = check_identity(1, "alice", ChainId(1), account()).unwrap_err();
        assert_eq!(err.reason_code(), "MALFORMED_REQUEST");

        let err = check_identity(0, ACCOUNT, ChainId(0), account()).unwrap_err();
        assert_eq!(err.reason_code(), "MALFORMED_REQUEST");
    }

    #[test]
    fn test_medium_risk_policies() {
        let medium = || RiskAssessment {
            level: RiskLevel::Medium,
            reasons: vec!["unlimited token approval".to_string()],
        };

        let err = apply_risk_policy(medium(), true, MediumRiskPolicy::Block).unwrap_err();
        assert!(matches!(err, PipelineError::RiskBlocked { level: RiskLevel::Medium, .. }));

        let err = apply_risk_policy(medium(), false, MediumRiskPolicy::RequireAcknowledgment)
            .unwrap_err();
        assert_eq!(err.reason_code(), "RISK_BLOCKED");

        let ((), warnings) =
            apply_risk_policy(medium(), true, MediumRiskPolicy::RequireAcknowledgment).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, warning_codes::RISK_ACKNOWLEDGED);
    }

    #[test]
    fn test_high_risk_always_blocks() {
        let high = RiskAssessment {
            level: RiskLevel::High,
            reasons: vec!["destination is blocked".to_string()],
        };
        let err = apply_risk_policy(high, true, MediumRiskPolicy::RequireAcknowledgment).unwrap_err();
        assert!(matches!(err, PipelineError::RiskBlocked { level: RiskLevel::High, .. }));
    }

    #[test]
    fn test_low_risk_becomes_warning() {
        let request = SigningRequest::new(1, ACCOUNT).data("0x6080");
        let ((), warnings) =
            screen_risk(&request, &RuleRiskScreener::default(), MediumRiskPolicy::Block).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].message, "contract deployment");
    }

    #[test]
    fn test_shape_validation() {
        let (shape, warnings) =
            validate_shape(&SigningRequest::new(1, ACCOUNT).to(DEST).value("0x10")).unwrap();
        assert_eq!(shape.value, 16);
        assert!(shape.data.is_empty());
        assert!(warnings.is_empty());

        let err = validate_shape(&SigningRequest::new(1, ACCOUNT)).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRequest { ref field, .. } if field == "to"));

        let err = validate_shape(&SigningRequest::new(1, ACCOUNT).to("0xnothex")).unwrap_err();
        assert_eq!(err.reason_code(), "MALFORMED_REQUEST");

        let err = validate_shape(&SigningRequest::new(1, ACCOUNT).to(DEST).value("-5")).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRequest { ref field, .. } if field == "value"));

        let (_, warnings) =
            validate_shape(&SigningRequest::new(1, ACCOUNT).to(DEST).data("0xab")).unwrap();
        assert_eq!(warnings[0].code, warning_codes::PAYLOAD_SHORT);
    }

    #[test]
    fn test_gas_field_exclusivity() {
        let config = GasConfig::default();
        let gas = GasFields {
            gas_price: Some("1000000000".into()),
            max_fee_per_gas: Some("1000000000".into()),
            ..GasFields::default()
        };
        assert!(validate_gas(&gas, false, &config).is_err());

        let gas = GasFields {
            max_priority_fee_per_gas: Some("1".into()),
            ..GasFields::default()
        };
        assert!(validate_gas(&gas, false, &config).is_err());
    }

    #[test]
    fn test_gas_bounds_and_warnings() {
        let config = GasConfig::default();

        let (settings, warnings) = validate_gas(&GasFields::default(), true, &config).unwrap();
        assert_eq!(settings, GasSettings::default());
        assert!(warnings.is_empty());

        let gas = GasFields {
            gas_limit: Some("20000".into()),
            ..GasFields::default()
        };
        assert!(validate_gas(&gas, false, &config).is_err());

        let gas = GasFields {
            gas_limit: Some("12000000".into()),
            gas_price: Some("600000000000".into()),
            ..GasFields::default()
        };
        let (settings, warnings) = validate_gas(&gas, false, &config).unwrap();
        assert_eq!(settings.gas_limit, Some(12_000_000));
        let codes: Vec<_> = warnings.iter().map(|w| w.code).collect();
        assert_eq!(codes, vec![warning_codes::GAS_LIMIT_HIGH, warning_codes::FEE_HIGH]);

        let gas = GasFields {
            gas_limit: Some("21000".into()),
            ..GasFields::default()
        };
        let (_, warnings) = validate_gas(&gas, true, &config).unwrap();
        assert_eq!(warnings[0].code, warning_codes::GAS_LIMIT_TIGHT);
    }

    #[test]
    fn test_fee_rules() {
        let config = GasConfig::default();

        let zero = GasFields {
            gas_price: Some("0".into()),
            ..GasFields::default()
        };
        assert!(validate_gas(&zero, false, &config).is_err());

        let above_cap = GasFields {
            gas_price: Some("10000000000001".into()),
            ..GasFields::default()
        };
        assert!(validate_gas(&above_cap, false, &config).is_err());

        let inverted = GasFields {
            max_fee_per_gas: Some("1000".into()),
            max_priority_fee_per_gas: Some("2000".into()),
            ..GasFields::default()
        };
        assert!(validate_gas(&inverted, false, &config).is_err());

        let ok = GasFields {
            max_fee_per_gas: Some("30000000000".into()),
            max_priority_fee_per_gas: Some("0".into()),
            ..GasFields::default()
        };
        let (settings, _) = validate_gas(&ok, false, &config).unwrap();
        assert_eq!(settings.pricing.unwrap().max_price(), 30_000_000_000);
    }

    fn unsigned_fields(gas_limit: Option<u64>) -> TransactionFields {
        TransactionFields {
            chain_id: ChainId(1),
            from: account(),
            to: Some(DEST.parse().unwrap()),
            value: 0,
            data: vec![],
            nonce: 0,
            gas_limit,
            pricing: None,
        }
    }

    #[test]
    fn test_apply_simulation() {
        let (fields, warnings) =
            apply_simulation(SimulationOutcome::succeeded(50_000, 10), unsigned_fields(None), 20, 1_000)
                .unwrap();
        assert_eq!(fields.gas_limit, Some(60_000));
        assert_eq!(warnings[0].code, warning_codes::GAS_ESTIMATED);

        let (_, warnings) =
            apply_simulation(SimulationOutcome::succeeded(50_000, 5_000), unsigned_fields(Some(60_000)), 20, 1_000)
                .unwrap();
        assert_eq!(warnings[0].code, warning_codes::SIMULATION_HIGH_COST);

        let err = apply_simulation(SimulationOutcome::succeeded(90_000, 0), unsigned_fields(Some(60_000)), 20, 1_000)
            .unwrap_err();
        assert_eq!(err.reason_code(), "INVALID_GAS_PARAMETERS");

        let err = apply_simulation(
            SimulationOutcome::reverted("ERC20: insufficient balance"),
            unsigned_fields(None),
            20,
            1_000,
        )
        .unwrap_err();
        assert_eq!(err, PipelineError::reverted("ERC20: insufficient balance"));
    }
}
