//! Margin-usage arithmetic for rebalancing decisions.
//!
//! Margin usage is `margin_in_use / account_equity`; the venue-specific
//! fields backing those two numbers live in the gateway.

use crate::exchange::AccountState;
use rust_decimal::Decimal;

/// Quote amount to add to the perpetual wallet so usage falls to `target`.
///
/// Solves `margin_in_use / (equity + x) = target` for `x`.
pub fn top_up_needed(account: &AccountState, target: Decimal) -> Decimal {
    if target <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (account.margin_in_use / target - account.account_equity).max(Decimal::ZERO)
}

/// Fraction of the position to close so usage falls to roughly `target`.
///
/// Solves `margin_in_use * (1 - r) / equity = target` for `r`.
pub fn shrink_ratio(account: &AccountState, target: Decimal) -> Decimal {
    if account.margin_in_use <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let ratio = Decimal::ONE - (target * account.account_equity) / account.margin_in_use;
    ratio.clamp(Decimal::ZERO, Decimal::ONE)
}
