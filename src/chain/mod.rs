//! External collaborator seams.
//!
//! The subsystem never talks to the chain or the identity graph directly; it
//! goes through two narrow traits so settlement logic is testable without
//! real money:
//! - [`PaymentChannel`]: confirmed-or-failed transfers plus an operator
//!   balance read - never an ambiguous "submitted" state
//! - [`IdentityResolver`]: payer fid to verified ETH destination

pub mod payment;
pub mod resolver;

pub use payment::{PaymentChannel, TransferReceipt, TreasuryClient};
pub use resolver::{FarcasterResolver, IdentityResolver, ResolvedDestination};
