//! Refund ledger and settlement.
//!
//! When a round is cancelled, every paid purchase becomes a per-payer refund
//! record (`ledger`). The settlement worker (`worker`) then drives pending
//! records to completion over the payment channel under a named TTL lock.

pub mod ledger;
pub mod worker;

pub use ledger::{
    RefundCreation, RefundLedger, RefundPreviewEntry, RefundRecord, RefundStatus, RefundSummary,
};
pub use worker::{BatchOutcome, SettlementWorker};
