//! Signing request types
//!
//! [`SigningRequest`] is what callers hand in: text fields exactly as they
//! arrived. Shape and gas validation turn it into typed
//! [`TransactionFields`], which is all the signer ever sees.

use crate::errors::StageResult;
use crate::pipeline::validators::{parse_hex_bytes, strip_hex_prefix};
use crate::types::{Address, ChainId, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Caller-supplied gas fields; legacy and fee-market fields are exclusive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<String>,
}

impl GasFields {
    pub fn is_empty(&self) -> bool {
        self.gas_limit.is_none()
            && self.gas_price.is_none()
            && self.max_fee_per_gas.is_none()
            && self.max_priority_fee_per_gas.is_none()
    }
}

/// One intended transaction, immutable once built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub chain_id: u64,
    pub account: String,
    /// Absent for contract creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Decimal or `0x` quantity, in wei
    #[serde(default = "default_value")]
    pub value: String,
    /// `0x`-prefixed hex payload
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub gas: GasFields,
    /// Caller confirmed a medium-risk warning
    #[serde(default)]
    pub risk_acknowledged: bool,
    /// Optional `BASE/QUOTE` pair to price the transfer with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_pair: Option<String>,
}

fn default_value() -> String {
    "0".to_string()
}

impl SigningRequest {
    pub fn new(chain_id: u64, account: impl Into<String>) -> Self {
        Self {
            chain_id,
            account: account.into(),
            to: None,
            value: default_value(),
            data: String::new(),
            gas: GasFields::default(),
            risk_acknowledged: false,
            quote_pair: None,
        }
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    pub fn gas_limit(mut self, gas_limit: impl Into<String>) -> Self {
        self.gas.gas_limit = Some(gas_limit.into());
        self
    }

    pub fn gas_price(mut self, gas_price: impl Into<String>) -> Self {
        self.gas.gas_price = Some(gas_price.into());
        self
    }

    pub fn fee_market(
        mut self,
        max_fee_per_gas: impl Into<String>,
        max_priority_fee_per_gas: impl Into<String>,
    ) -> Self {
        self.gas.max_fee_per_gas = Some(max_fee_per_gas.into());
        self.gas.max_priority_fee_per_gas = Some(max_priority_fee_per_gas.into());
        self
    }

    pub fn acknowledge_risk(mut self) -> Self {
        self.risk_acknowledged = true;
        self
    }

    pub fn quote_pair(mut self, pair: impl Into<String>) -> Self {
        self.quote_pair = Some(pair.into());
        self
    }
}

/// Message to sign with the account key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub chain_id: u64,
    pub account: String,
    /// `0x` hex is decoded; anything else is signed as UTF-8 text
    pub message: String,
    #[serde(default)]
    pub risk_acknowledged: bool,
}

impl MessageRequest {
    /// Raw message bytes
    ///
    /// A hex-prefixed message that does not decode is malformed rather than
    /// silently signed as text.
    pub fn message_bytes(&self) -> StageResult<Vec<u8>> {
        match strip_hex_prefix(&self.message) {
            Some(_) => parse_hex_bytes("message", &self.message),
            None => Ok(self.message.as_bytes().to_vec()),
        }
    }
}

/// Structured data to sign (domain, type definitions, message value)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedData {
    pub domain: serde_json::Value,
    pub types: serde_json::Value,
    #[serde(rename = "primaryType")]
    pub primary_type: String,
    pub message: serde_json::Value,
}

impl TypedData {
    /// Chain id declared by the domain, if any
    pub fn domain_chain_id(&self) -> Option<Result<u64, String>> {
        let value = self.domain.get("chainId")?;
        Some(match value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| format!("chainId {} is not an unsigned integer", n)),
            serde_json::Value::String(s) => {
                crate::pipeline::validators::parse_quantity("domain.chainId", s)
                    .map_err(|e| e.to_string())
                    .and_then(|q| u64::try_from(q).map_err(|_| "chainId out of range".to_string()))
            }
            other => Err(format!("chainId has unsupported type: {}", other)),
        })
    }

    /// Deterministic byte encoding (object keys are sorted)
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // serde_json::Value objects are BTreeMap-backed, so this is stable
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedDataRequest {
    pub chain_id: u64,
    pub account: String,
    pub typed_data: TypedData,
    #[serde(default)]
    pub risk_acknowledged: bool,
}

/// Validated gas pricing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GasPricing {
    Legacy {
        gas_price: u128,
    },
    FeeMarket {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

impl GasPricing {
    /// Highest price per gas the transaction can pay
    pub fn max_price(&self) -> u128 {
        match self {
            GasPricing::Legacy { gas_price } => *gas_price,
            GasPricing::FeeMarket {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

/// Typed transaction fields handed to the signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionFields {
    pub chain_id: ChainId,
    pub from: Address,
    pub to: Option<Address>,
    pub value: u128,
    #[serde(serialize_with = "serialize_hex")]
    pub data: Vec<u8>,
    pub nonce: Nonce,
    pub gas_limit: Option<u64>,
    pub pricing: Option<GasPricing>,
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
}

impl TransactionFields {
    /// Canonical encoding covered by the signature
    ///
    /// Fixed-width big-endian integers, one-byte presence tags for optional
    /// fields, and a length prefix on the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.data.len());
        out.extend_from_slice(&self.chain_id.0.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(self.from.as_bytes());
        match &self.to {
            Some(to) => {
                out.push(1);
                out.extend_from_slice(to.as_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.value.to_be_bytes());
        match self.gas_limit {
            Some(limit) => {
                out.push(1);
                out.extend_from_slice(&limit.to_be_bytes());
            }
            None => out.push(0),
        }
        match self.pricing {
            Some(GasPricing::Legacy { gas_price }) => {
                out.push(1);
                out.extend_from_slice(&gas_price.to_be_bytes());
            }
            Some(GasPricing::FeeMarket {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }) => {
                out.push(2);
                out.extend_from_slice(&max_fee_per_gas.to_be_bytes());
                out.extend_from_slice(&max_priority_fee_per_gas.to_be_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.data.len() as u64).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// SHA-256 of [`TransactionFields::encode`]
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.encode()).into()
    }
}
