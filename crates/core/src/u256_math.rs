//! U256 arithmetic for sizing rebalance takes.
//!
//! All ratios are WAD-scaled (1e18 = 1.0). Amounts are raw token units.
//! Everything here is pure so the sizing can be checked without a node.

use alloy::primitives::U256;
pub use rebalancer_chain::{BPS, WAD};

/// Basis points denominator as U256 (10000 = 100%)
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([BPS, 0, 0, 0]);

/// Apply basis points reduction (e.g., for the safety discount).
/// Returns: value * (10000 - basis_points) / 10000
///
/// Example: apply_basis_points(1000, 100) = 990 (1% reduction)
#[inline(always)]
pub fn apply_basis_points(value: U256, basis_points: u64) -> U256 {
    let factor = U256::from(BPS.saturating_sub(basis_points));
    (value * factor) / BPS_DENOMINATOR
}

/// Apply basis points increase (e.g., for the rebalance reward).
/// Returns: value * (10000 + basis_points) / 10000
#[inline(always)]
pub fn apply_basis_points_up(value: U256, basis_points: u64) -> U256 {
    let factor = U256::from(BPS.saturating_add(basis_points));
    (value * factor) / BPS_DENOMINATOR
}

/// Debt to add so that `collateral / (debt + x) == target`.
///
/// `x = (C·1e18 − T·debt) / (T − 1e18)`, zero when the position is not
/// over target or the target is at or below 1.0.
pub fn excess_collateral_delta(collateral: U256, debt: U256, target: U256) -> U256 {
    if target <= WAD {
        return U256::ZERO;
    }
    let lhs = collateral * WAD;
    let rhs = target * debt;
    if lhs <= rhs {
        return U256::ZERO;
    }
    (lhs - rhs) / (target - WAD)
}

/// Debt to repay (in debt units of collateral removed) so that
/// `(collateral − x) / (debt − x) == target`.
///
/// `x = (T·debt − C·1e18) / (T − 1e18)`, zero when the position is not
/// under target.
pub fn collateral_shortfall_delta(collateral: U256, debt: U256, target: U256) -> U256 {
    if target <= WAD {
        return U256::ZERO;
    }
    let lhs = target * debt;
    let rhs = collateral * WAD;
    if lhs <= rhs {
        return U256::ZERO;
    }
    (lhs - rhs) / (target - WAD)
}

/// Debt repaid by a pre-liquidation that restores `target`, given the
/// reward paid on seized collateral, capped at `close_factor_bps` of debt.
///
/// Seizing `x·(1 + r)` of collateral while repaying `x` of debt:
/// `x = (T·debt − C·1e18) / (T − 1e18 − r·1e18)`. When the denominator is
/// not positive the target is unreachable and the cap applies.
pub fn pre_liquidation_repay(
    collateral: U256,
    debt: U256,
    target: U256,
    reward_bps: u64,
    close_factor_bps: u64,
) -> U256 {
    let cap = debt * U256::from(close_factor_bps.min(BPS)) / BPS_DENOMINATOR;
    let lhs = target * debt;
    let rhs = collateral * WAD;
    if lhs <= rhs {
        return U256::ZERO;
    }

    let reward_wad = WAD * U256::from(reward_bps) / BPS_DENOMINATOR;
    let floor = WAD + reward_wad;
    if target <= floor {
        return cap;
    }

    let repay = (lhs - rhs) / (target - floor);
    repay.min(cap)
}

/// Collateral seized (in debt units) for repaying `repay` at `reward_bps`.
#[inline(always)]
pub fn seized_for_repay(repay: U256, reward_bps: u64) -> U256 {
    apply_basis_points_up(repay, reward_bps)
}

/// Convert WAD (18 decimals) to f64.
/// Use only for display/logging, not for computation.
#[inline(always)]
pub fn wad_to_f64(wad: U256) -> f64 {
    if wad <= U256::from(u128::MAX) {
        let value: u128 = wad.to();
        value as f64 / 1e18
    } else {
        let limbs = wad.as_limbs();
        let high = limbs[1] as f64 * (u64::MAX as f64 + 1.0);
        let low = limbs[0] as f64;
        (high + low) / 1e18
    }
}
