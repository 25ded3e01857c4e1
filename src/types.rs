//! Primitive types shared by the ledger, the breaker registry and the pipeline

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A per-account, per-chain sequence number
pub type Nonce = u64;

static ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("static address pattern"));

/// 20-byte account address, written as `0x` followed by 40 hex digits
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

/// Reasons an address string was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("address is empty")]
    Empty,
    #[error("address must be 0x followed by 40 hex digits, got {len} characters")]
    BadFormat { len: usize },
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressParseError::Empty);
        }
        if !ADDRESS_RE.is_match(s) {
            return Err(AddressParseError::BadFormat { len: s.len() });
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(&s[2..], &mut bytes)
            .map_err(|_| AddressParseError::BadFormat { len: s.len() })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Chain identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-byte transaction hash
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash(pub [u8; 32]);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", self)
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Opaque signature bytes returned by a signer
///
/// The Debug implementation only prints a short prefix so signatures do not
/// end up verbatim in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SignatureBytes(pub Vec<u8>);

impl SignatureBytes {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview = &self.0[..self.0.len().min(4)];
        write!(
            f,
            "SignatureBytes(0x{}.. {} bytes)",
            hex::encode(preview),
            self.0.len()
        )
    }
}

impl Serialize for SignatureBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_and_display() {
        let addr: Address = "0x52908400098527886E0F7030069857D2E4169EE7".parse().unwrap();
        assert_eq!(
            addr.to_string(),
            "0x52908400098527886e0f7030069857d2e4169ee7"
        );
        assert!(!addr.is_zero());
        assert!(Address::ZERO.is_zero());
    }

    #[test]
    fn test_address_rejects_bad_input() {
        assert_eq!("".parse::<Address>(), Err(AddressParseError::Empty));
        assert!("52908400098527886E0F7030069857D2E4169EE7".parse::<Address>().is_err());
        assert!("0x5290840009852788".parse::<Address>().is_err());
        assert!("0xZZ908400098527886E0F7030069857D2E4169EE7".parse::<Address>().is_err());
        assert!(" 0x52908400098527886E0F7030069857D2E4169EE7".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_serde() {
        let addr: Address = serde_json::from_str("\"0x00000000000000000000000000000000000000ff\"").unwrap();
        assert_eq!(addr.as_bytes()[19], 0xff);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"0x00000000000000000000000000000000000000ff\"");
    }

    #[test]
    fn test_signature_debug_is_truncated() {
        let sig = SignatureBytes(vec![0xab; 64]);
        let dbg = format!("{:?}", sig);
        assert!(dbg.contains("abababab.."));
        assert!(dbg.contains("64 bytes"));
        assert!(!dbg.contains(&"ab".repeat(10)));
    }
}
