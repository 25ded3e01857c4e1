//! Risk screening
//!
//! A screener is a pure classifier: it never blocks on its own. The risk
//! stage turns its verdict into a rejection or warnings according to
//! [`MediumRiskPolicy`].

use crate::config::RiskConfig;
use crate::pipeline::request::TypedData;
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// ERC-20 `approve(address,uint256)`
const APPROVE_SELECTOR: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];
/// ERC-721/1155 `setApprovalForAll(address,bool)`
const SET_APPROVAL_FOR_ALL_SELECTOR: [u8; 4] = [0xa2, 0x2c, 0xb4, 0x65];

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        f.write_str(s)
    }
}

/// What to do with a medium-risk request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediumRiskPolicy {
    /// Reject outright
    #[default]
    Block,
    /// Continue with a warning when the caller acknowledged the risk
    RequireAcknowledgment,
}

impl FromStr for MediumRiskPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(MediumRiskPolicy::Block),
            "require_acknowledgment" => Ok(MediumRiskPolicy::RequireAcknowledgment),
            other => Err(format!("unknown medium risk policy '{}'", other)),
        }
    }
}

/// Screener verdict
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reasons: Vec<String>,
}

impl RiskAssessment {
    pub fn none() -> Self {
        Self::default()
    }

    /// Record a finding; the overall level is the highest finding
    pub fn flag(&mut self, level: RiskLevel, reason: impl Into<String>) {
        self.level = self.level.max(level);
        self.reasons.push(reason.into());
    }
}

/// Classifies requests by risk; implementations must be side-effect free
pub trait RiskScreener: Send + Sync {
    fn classify(&self, destination: Option<&Address>, value: u128, payload: &[u8]) -> RiskAssessment;

    fn classify_message(&self, _message: &[u8]) -> RiskAssessment {
        RiskAssessment::none()
    }

    fn classify_typed_data(&self, _typed_data: &TypedData) -> RiskAssessment {
        RiskAssessment::none()
    }
}

/// Rule-based screener configured from `[risk]`
#[derive(Debug, Clone, Default)]
pub struct RuleRiskScreener {
    blocked: HashSet<Address>,
    large_value_wei: u128,
}

impl RuleRiskScreener {
    pub fn new(blocked: impl IntoIterator<Item = Address>, large_value_wei: u128) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
            large_value_wei,
        }
    }

    /// Unparseable block-list entries are skipped; `Config::validate` rejects them
    pub fn from_config(config: &RiskConfig) -> Self {
        let blocked = config
            .blocked_destinations
            .iter()
            .filter_map(|s| s.parse::<Address>().ok());
        Self::new(blocked, config.large_value_wei())
    }
}

fn is_unlimited_approval(payload: &[u8]) -> bool {
    payload.len() >= 68
        && payload[..4] == APPROVE_SELECTOR
        && payload[36..68].iter().all(|b| *b == 0xff)
}

fn is_approval_for_all(payload: &[u8]) -> bool {
    payload.len() >= 68
        && payload[..4] == SET_APPROVAL_FOR_ALL_SELECTOR
        && payload[36..67].iter().all(|b| *b == 0)
        && payload[67] == 1
}

impl RiskScreener for RuleRiskScreener {
    fn classify(&self, destination: Option<&Address>, value: u128, payload: &[u8]) -> RiskAssessment {
        let mut assessment = RiskAssessment::none();

        match destination {
            Some(to) if self.blocked.contains(to) => {
                assessment.flag(RiskLevel::High, format!("destination {} is blocked", to));
            }
            Some(to) if to.is_zero() && value > 0 => {
                assessment.flag(RiskLevel::High, "value sent to the zero address");
            }
            None => assessment.flag(RiskLevel::Low, "contract deployment"),
            _ => {}
        }

        if is_unlimited_approval(payload) {
            assessment.flag(RiskLevel::Medium, "unlimited token approval");
        }
        if is_approval_for_all(payload) {
            assessment.flag(RiskLevel::Medium, "operator approval for all tokens");
        }
        if self.large_value_wei > 0 && value > self.large_value_wei {
            assessment.flag(RiskLevel::Low, "large value transfer");
        }
        assessment
    }

    fn classify_message(&self, message: &[u8]) -> RiskAssessment {
        let mut assessment = RiskAssessment::none();
        // A bare 32-byte message is most likely a hash signed blind
        if message.len() == 32 && std::str::from_utf8(message).is_err() {
            assessment.flag(RiskLevel::Medium, "blind signature over a raw 32-byte hash");
        }
        assessment
    }

    fn classify_typed_data(&self, typed_data: &TypedData) -> RiskAssessment {
        let mut assessment = RiskAssessment::none();
        if typed_data.primary_type.starts_with("Permit") {
            assessment.flag(RiskLevel::Medium, "token permit grants spending rights");
        }
        if let Some(spender) = typed_data
            .message
            .get("spender")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Address>().ok())
        {
            if self.blocked.contains(&spender) {
                assessment.flag(RiskLevel::High, format!("spender {} is blocked", spender));
            }
        }
        assessment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approve(amount: [u8; 32]) -> Vec<u8> {
        let mut payload = APPROVE_SELECTOR.to_vec();
        payload.extend_from_slice(&[0u8; 12]);
        payload.extend_from_slice(&[0x11; 20]);
        payload.extend_from_slice(&amount);
        payload
    }

    #[test]
    fn test_blocked_destination_is_high() {
        let bad = Address::from_bytes([0xba; 20]);
        let screener = RuleRiskScreener::new([bad], 0);
        let assessment = screener.classify(Some(&bad), 0, &[]);
        assert_eq!(assessment.level, RiskLevel::High);
        assert_eq!(assessment.reasons.len(), 1);
    }

    #[test]
    fn test_zero_address_with_value_is_high() {
        let screener = RuleRiskScreener::default();
        assert_eq!(screener.classify(Some(&Address::ZERO), 1, &[]).level, RiskLevel::High);
        assert_eq!(screener.classify(Some(&Address::ZERO), 0, &[]).level, RiskLevel::None);
    }

    #[test]
    fn test_unlimited_approval_is_medium() {
        let screener = RuleRiskScreener::default();
        let to = Address::from_bytes([1; 20]);
        assert_eq!(screener.classify(Some(&to), 0, &approve([0xff; 32])).level, RiskLevel::Medium);

        let mut bounded = [0u8; 32];
        bounded[31] = 100;
        assert_eq!(screener.classify(Some(&to), 0, &approve(bounded)).level, RiskLevel::None);
    }

    #[test]
    fn test_levels_combine_to_maximum() {
        let screener = RuleRiskScreener::new([], 1_000);
        let assessment = screener.classify(None, 5_000, &approve([0xff; 32]));
        assert_eq!(assessment.level, RiskLevel::Medium);
        assert_eq!(assessment.reasons.len(), 3);
    }

    #[test]
    fn test_blind_hash_message_is_medium() {
        let screener = RuleRiskScreener::default();
        assert_eq!(screener.classify_message(&[0xfe; 32]).level, RiskLevel::Medium);
        assert_eq!(screener.classify_message(b"Sign in to Market").level, RiskLevel::None);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("block".parse::<MediumRiskPolicy>().unwrap(), MediumRiskPolicy::Block);
        assert!("warn".parse::<MediumRiskPolicy>().is_err());
    }
}
