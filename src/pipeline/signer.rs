//! Signer boundary
//!
//! The pipeline hands a signer fully validated fields and gets opaque
//! signature bytes back; it never touches key material.

use crate::pipeline::request::{TransactionFields, TypedData};
use crate::pipeline::validators::strip_hex_prefix;
use crate::types::{Address, ChainId, SignatureBytes};
use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SignerError {
    /// User or policy on the device declined
    #[error("signing rejected: {0}")]
    Rejected(String),

    /// Signer not reachable (device unplugged, keystore locked)
    #[error("signer unavailable: {0}")]
    Unavailable(String),

    /// Hardware device reported an error
    #[error("device error: {0}")]
    Device(String),

    /// Signer refused the payload as malformed
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl SignerError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SignerError::Unavailable(_) | SignerError::Device(_))
    }
}

/// Software key store or hardware device
#[async_trait]
pub trait ExternalSigner: Send + Sync {
    /// Account the signer controls
    fn account(&self) -> Address;

    /// Chain the signer is connected to
    fn chain_id(&self) -> ChainId;

    async fn sign_transaction(
        &self,
        fields: &TransactionFields,
        chain_id: ChainId,
    ) -> Result<SignatureBytes, SignerError>;

    async fn sign_message(&self, message: &[u8]) -> Result<SignatureBytes, SignerError>;

    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<SignatureBytes, SignerError>;
}

/// Prefix mixed into message digests so a message can never pass for a transaction
pub fn message_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(format!("\x19Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

pub fn typed_data_digest(typed_data: &TypedData) -> [u8; 32] {
    let domain = Sha256::digest(serde_json::to_vec(&typed_data.domain).unwrap_or_default());
    let body = Sha256::digest(typed_data.canonical_bytes());
    let mut hasher = Sha256::new();
    hasher.update([0x19, 0x01]);
    hasher.update(domain);
    hasher.update(body);
    hasher.finalize().into()
}

/// Account address derived from a public key: last 20 bytes of its SHA-256
pub fn address_of(key: &VerifyingKey) -> Address {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[12..]);
    Address::from_bytes(bytes)
}

/// In-process ed25519 signer
///
/// The secret is zeroized when the signer is dropped.
pub struct LocalKeySigner {
    key: SigningKey,
    account: Address,
    chain_id: ChainId,
}

impl LocalKeySigner {
    pub fn new(key: SigningKey, chain_id: ChainId) -> Self {
        let account = address_of(&key.verifying_key());
        Self {
            key,
            account,
            chain_id,
        }
    }

    pub fn generate(chain_id: ChainId) -> Self {
        Self::new(SigningKey::generate(&mut OsRng), chain_id)
    }

    /// Load a 32-byte secret given as hex, with or without `0x`
    pub fn from_secret_hex(secret: &str, chain_id: ChainId) -> Result<Self, SignerError> {
        let body = secret.trim();
        let body = strip_hex_prefix(body).unwrap_or(body);
        let bytes = Zeroizing::new(
            hex::decode(body).map_err(|e| SignerError::InvalidKey(e.to_string()))?,
        );
        let secret: Zeroizing<[u8; 32]> = Zeroizing::new(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| SignerError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?,
        );
        Ok(Self::new(SigningKey::from_bytes(&secret), chain_id))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }

    /// Export the secret; the returned buffer is zeroized on drop
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.key.to_bytes()))
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> SignatureBytes {
        SignatureBytes(self.key.sign(digest).to_bytes().to_vec())
    }
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("account", &self.account)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ExternalSigner for LocalKeySigner {
    fn account(&self) -> Address {
        self.account
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn sign_transaction(
        &self,
        fields: &TransactionFields,
        chain_id: ChainId,
    ) -> Result<SignatureBytes, SignerError> {
        if chain_id != self.chain_id || fields.chain_id != chain_id {
            return Err(SignerError::InvalidPayload(format!(
                "transaction for chain {} but key is bound to chain {}",
                fields.chain_id, self.chain_id
            )));
        }
        if fields.from != self.account {
            return Err(SignerError::InvalidPayload(format!(
                "transaction from {} but key controls {}",
                fields.from, self.account
            )));
        }
        Ok(self.sign_digest(&fields.digest()))
    }

    async fn sign_message(&self, message: &[u8]) -> Result<SignatureBytes, SignerError> {
        Ok(self.sign_digest(&message_digest(message)))
    }

    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<SignatureBytes, SignerError> {
        Ok(self.sign_digest(&typed_data_digest(typed_data)))
    }
}
