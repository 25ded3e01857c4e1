//! Mock collaborators for pipeline tests
//!
//! Compiled for tests and behind the `test_utils` feature.

use crate::chain_source::{ChainSourceError, ChainTruthSource, Receipt};
use crate::pipeline::quote::{QuoteError, QuotePair, QuoteProvider};
use crate::pipeline::request::{TransactionFields, TypedData};
use crate::pipeline::signer::{message_digest, typed_data_digest, ExternalSigner, SignerError};
use crate::pipeline::simulate::{SimulationError, SimulationOutcome, Simulator};
use crate::types::{Address, ChainId, Nonce, SignatureBytes, TxHash};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

fn fake_signature(digest: [u8; 32]) -> SignatureBytes {
    let mut bytes = digest.to_vec();
    bytes.extend_from_slice(&digest);
    SignatureBytes(bytes)
}

// ============================================================================
// SIGNER
// ============================================================================

#[derive(Debug, Clone)]
enum SignerBehavior {
    Sign,
    Fail(SignerError),
    /// Park until the call is dropped
    Hang,
}

/// Signer whose answers are set by the test
#[derive(Debug)]
pub struct MockSigner {
    account: Address,
    chain_id: ChainId,
    behavior: Mutex<SignerBehavior>,
    calls: AtomicUsize,
    last_transaction: Mutex<Option<TransactionFields>>,
    entered: Arc<Notify>,
}

impl MockSigner {
    pub fn new(account: Address, chain_id: ChainId) -> Self {
        Self {
            account,
            chain_id,
            behavior: Mutex::new(SignerBehavior::Sign),
            calls: AtomicUsize::new(0),
            last_transaction: Mutex::new(None),
            entered: Arc::new(Notify::new()),
        }
    }

    pub fn fail_with(&self, err: SignerError) {
        *self.behavior.lock() = SignerBehavior::Fail(err);
    }

    pub fn hang(&self) {
        *self.behavior.lock() = SignerBehavior::Hang;
    }

    pub fn succeed(&self) {
        *self.behavior.lock() = SignerBehavior::Sign;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_transaction(&self) -> Option<TransactionFields> {
        self.last_transaction.lock().clone()
    }

    /// Resolves once a signing call has started
    pub async fn wait_until_called(&self) {
        self.entered.notified().await
    }

    async fn answer(&self, digest: [u8; 32]) -> Result<SignatureBytes, SignerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        let behavior = self.behavior.lock().clone();
        match behavior {
            SignerBehavior::Sign => Ok(fake_signature(digest)),
            SignerBehavior::Fail(err) => Err(err),
            SignerBehavior::Hang => futures::future::pending().await,
        }
    }
}

#[async_trait]
impl ExternalSigner for MockSigner {
    fn account(&self) -> Address {
        self.account
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn sign_transaction(
        &self,
        fields: &TransactionFields,
        _chain_id: ChainId,
    ) -> Result<SignatureBytes, SignerError> {
        *self.last_transaction.lock() = Some(fields.clone());
        self.answer(fields.digest()).await
    }

    async fn sign_message(&self, message: &[u8]) -> Result<SignatureBytes, SignerError> {
        self.answer(message_digest(message)).await
    }

    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<SignatureBytes, SignerError> {
        self.answer(typed_data_digest(typed_data)).await
    }
}

// ============================================================================
// SIMULATOR
// ============================================================================

/// Simulator that replays queued answers, then a default one
#[derive(Debug)]
pub struct ScriptedSimulator {
    script: Mutex<VecDeque<Result<SimulationOutcome, SimulationError>>>,
    default: Mutex<Result<SimulationOutcome, SimulationError>>,
    calls: AtomicUsize,
}

impl Default for ScriptedSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSimulator {
    /// Succeeds with a 50k gas estimate unless scripted otherwise
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Ok(SimulationOutcome::succeeded(50_000, 0))),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, answer: Result<SimulationOutcome, SimulationError>) {
        self.script.lock().push_back(answer);
    }

    pub fn always(&self, answer: Result<SimulationOutcome, SimulationError>) {
        *self.default.lock() = answer;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Simulator for ScriptedSimulator {
    async fn simulate(&self, _fields: &TransactionFields) -> Result<SimulationOutcome, SimulationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.default.lock().clone())
    }
}

// ============================================================================
// CHAIN TRUTH
// ============================================================================

/// Chain-truth source with fixed answers
#[derive(Debug)]
pub struct StaticChainSource {
    transaction_count: AtomicU64,
    gas_estimate: Mutex<Result<u64, ChainSourceError>>,
    receipts_dropped: Mutex<bool>,
}

impl StaticChainSource {
    pub fn new(transaction_count: Nonce) -> Self {
        Self {
            transaction_count: AtomicU64::new(transaction_count),
            gas_estimate: Mutex::new(Ok(21_000)),
            receipts_dropped: Mutex::new(false),
        }
    }

    pub fn with_gas_estimate(self, gas: u64) -> Self {
        *self.gas_estimate.lock() = Ok(gas);
        self
    }

    pub fn set_transaction_count(&self, count: Nonce) {
        self.transaction_count.store(count, Ordering::SeqCst);
    }

    pub fn fail_estimates(&self, err: ChainSourceError) {
        *self.gas_estimate.lock() = Err(err);
    }

    pub fn drop_receipts(&self) {
        *self.receipts_dropped.lock() = true;
    }
}

#[async_trait]
impl ChainTruthSource for StaticChainSource {
    async fn estimate_gas(
        &self,
        _chain_id: ChainId,
        _from: Address,
        _to: Option<Address>,
        _value: u128,
        _data: &[u8],
    ) -> Result<u64, ChainSourceError> {
        self.gas_estimate.lock().clone()
    }

    async fn get_transaction_count(
        &self,
        _account: Address,
        _chain_id: ChainId,
    ) -> Result<Nonce, ChainSourceError> {
        Ok(self.transaction_count.load(Ordering::SeqCst))
    }

    async fn wait_for_receipt(
        &self,
        _chain_id: ChainId,
        hash: TxHash,
    ) -> Result<Receipt, ChainSourceError> {
        if *self.receipts_dropped.lock() {
            return Err(ChainSourceError::Dropped(hash));
        }
        Ok(Receipt {
            hash,
            block_number: 1,
            success: true,
        })
    }
}

// ============================================================================
// QUOTES
// ============================================================================

/// Quote provider returning one price for every pair
#[derive(Debug)]
pub struct StaticQuoteProvider {
    answer: Mutex<Result<f64, QuoteError>>,
}

impl StaticQuoteProvider {
    pub fn new(price: f64) -> Self {
        Self {
            answer: Mutex::new(Ok(price)),
        }
    }

    pub fn set_price(&self, price: f64) {
        *self.answer.lock() = Ok(price);
    }

    pub fn fail_with(&self, err: QuoteError) {
        *self.answer.lock() = Err(err);
    }
}

#[async_trait]
impl QuoteProvider for StaticQuoteProvider {
    async fn fetch_price(&self, _pair: &QuotePair) -> Result<f64, QuoteError> {
        self.answer.lock().clone()
    }
}
