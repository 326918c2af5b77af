//! Telemetry event surface.
//!
//! Events are emitted as structured `tracing` records under the `telemetry`
//! target so a subscriber can route them to an external sink independently
//! of diagnostic logs.

use crate::exchange::AccountState;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

pub const TARGET: &str = "telemetry";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    Full,
    Rebalance,
}

impl ExitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitType::Full => "full",
            ExitType::Rebalance => "rebalance",
        }
    }
}

pub fn trade_entry(symbol: &str, entry_price: Decimal, size: Decimal, notional_quote: Decimal) {
    info!(
        target: TARGET,
        event = "trade",
        action = "entry",
        symbol,
        %entry_price,
        %size,
        %notional_quote,
    );
}

pub fn trade_exit(
    symbol: &str,
    entry_price: Decimal,
    size: Decimal,
    notional_quote: Decimal,
    exit_type: ExitType,
) {
    info!(
        target: TARGET,
        event = "trade",
        action = "exit",
        symbol,
        %entry_price,
        %size,
        %notional_quote,
        exit_type = exit_type.as_str(),
    );
}

pub fn wallet(account: &AccountState) {
    info!(
        target: TARGET,
        event = "wallet",
        withdrawable = %account.withdrawable,
        margin_used = %account.margin_in_use,
        margin_usage_pct = %(account.margin_usage() * dec!(100)),
        account_value = %account.account_equity,
    );
}

pub fn guardian_negative_fr(symbol: &str, consecutive_negative_fr: u32) {
    info!(
        target: TARGET,
        event = "guardian",
        trigger = "trigger_exit_negative_fr",
        symbol,
        consecutive_negative_fr,
    );
}

pub fn guardian_backwardation(symbol: &str, spread: Decimal) {
    info!(
        target: TARGET,
        event = "guardian",
        trigger = "trigger_exit_backwardation",
        symbol,
        %spread,
    );
}

pub fn entry_aborted_leg_recovered(symbol: &str, leg: &str) {
    warn!(
        target: TARGET,
        event = "entry_aborted_leg_recovered",
        symbol,
        leg,
    );
}

pub fn entry_aborted_clean(symbol: &str) {
    info!(target: TARGET, event = "entry_aborted_clean", symbol);
}

pub fn manual_intervention(symbol: &str, reason: &str) {
    error!(
        target: TARGET,
        event = "manual_intervention",
        symbol,
        reason,
    );
}
