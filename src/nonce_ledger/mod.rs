//! Nonce Ledger Module
//!
//! Per-account, per-chain sequence tracking with reservation, confirmation,
//! gap parking and reconciliation against chain truth.

// Submodules
pub mod ledger;
pub mod ledger_errors;
pub mod ledger_record;
pub mod ledger_reservation;
pub mod ledger_sweeper;
pub mod ledger_sync;

// Re-exports for convenience
pub use ledger::{LedgerKey, NonceLedger, DEFAULT_MAX_NONCE_GAP};
pub use ledger_errors::{LedgerError, LedgerResult};
pub use ledger_record::NonceRecord;
pub use ledger_reservation::NonceReservation;
pub use ledger_sweeper::LedgerSweeper;
pub use ledger_sync::{ConfirmationStatus, ConfirmationTracker};
