//! Tiered prize-pool distribution.
//!
//! Pure, deterministic, no I/O. Given 1-10 ranked winners (best to worst) and
//! a pool in wei, allocates the pool by a fixed basis-point schedule,
//! renormalized when fewer than ten winners are supplied. Flooring remainder
//! ("dust") is credited entirely to rank 1 so the allocations always sum to
//! the pool exactly.

use serde::{Deserialize, Serialize};

use crate::error::{OpsError, OpsResult};

/// Basis points per rank out of [`BPS_TOTAL`], ranks 1-10.
pub const PAYOUT_SCHEDULE_BPS: [u128; 10] =
    [1900, 1600, 1400, 1100, 1000, 600, 600, 600, 600, 600];
pub const BPS_TOTAL: u128 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutAllocation {
    pub fid: u64,
    pub amount_wei: u128,
}

/// Allocate `pool_wei` across `ranked_fids` (index 0 = rank 1).
///
/// Returns one allocation per input fid, in rank order. The sum of the
/// returned amounts equals `pool_wei` exactly; a mismatch after the dust
/// credit is a logic defect and panics.
pub fn calculate_payouts(ranked_fids: &[u64], pool_wei: u128) -> OpsResult<Vec<PayoutAllocation>> {
    if ranked_fids.is_empty() || ranked_fids.len() > PAYOUT_SCHEDULE_BPS.len() {
        return Err(OpsError::validation(format!(
            "winner list must hold 1-10 fids, got {}",
            ranked_fids.len()
        )));
    }
    if ranked_fids.contains(&0) {
        return Err(OpsError::validation("winner fid 0 is not a valid identity"));
    }
    for (i, fid) in ranked_fids.iter().enumerate() {
        if ranked_fids[..i].contains(fid) {
            return Err(OpsError::validation(format!("duplicate winner fid {fid}")));
        }
    }

    let selected = &PAYOUT_SCHEDULE_BPS[..ranked_fids.len()];
    let selected_sum: u128 = selected.iter().sum();

    // Integer renormalization: each selected entry scaled so the slice sums
    // to (approximately) BPS_TOTAL again. Flooring here is absorbed by the
    // dust credit below.
    let normalized: Vec<u128> = selected
        .iter()
        .map(|bps| bps * BPS_TOTAL / selected_sum)
        .collect();

    let mut amounts: Vec<u128> = normalized
        .iter()
        .map(|bps| pool_wei * bps / BPS_TOTAL)
        .collect();

    let allocated: u128 = amounts.iter().sum();
    let dust = pool_wei - allocated;
    amounts[0] += dust;

    let total: u128 = amounts.iter().sum();
    assert_eq!(
        total, pool_wei,
        "payout allocations ({total} wei) do not reconcile to the pool ({pool_wei} wei)"
    );

    Ok(ranked_fids
        .iter()
        .zip(amounts)
        .map(|(&fid, amount_wei)| PayoutAllocation { fid, amount_wei })
        .collect())
}
