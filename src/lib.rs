//! WordPot Backend Library
//!
//! Operational control and financial settlement subsystem for the WordPot
//! word-guessing jackpot game: operational flags (kill switch / dead day),
//! round cancellation with a per-payer refund ledger, the lock-guarded
//! settlement worker, and the tiered payout calculator.

pub mod api;
pub mod chain;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod ops;
pub mod payout;
pub mod refunds;
pub mod rounds;
