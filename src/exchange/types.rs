//! Domain types shared across gateway implementations.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::decimal::safe_div;

/// Which side of the venue an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Spot,
    Perp,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Spot => write!(f, "spot"),
            Venue::Perp => write!(f, "perp"),
        }
    }
}

/// Wallet identifier for internal transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wallet {
    Spot,
    Perp,
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that unwinds a fill on this side.
    pub fn reversed(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// A tradable perpetual/spot pair discovered on the venue.
///
/// Immutable once discovered; `symbol` names both instruments on venues that
/// share tickers between spot and perpetual markets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
}

/// Funding data for a perpetual contract.
#[derive(Debug, Clone)]
pub struct FundingSnapshot {
    pub symbol: String,
    /// Predicted rate for the next funding interval.
    pub predicted_rate: Decimal,
    /// Next settlement time, unix milliseconds.
    pub next_funding_time: i64,
}

/// Best bid/ask for one instrument.
#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Ticker {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Venue trading constraints for one instrument.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentRules {
    /// Minimum tradable quantity.
    pub min_qty: Decimal,
    /// Minimum quantity increment.
    pub step_size: Decimal,
    /// Minimum price increment.
    pub tick_size: Decimal,
}

/// A filled market order.
#[derive(Debug, Clone)]
pub struct Fill {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    /// Fee paid, quote currency.
    pub fee: Decimal,
}

/// Full snapshot of the perpetual account's margin situation.
///
/// Every sample is complete; fields are never carried over between samples.
#[derive(Debug, Clone, Copy)]
pub struct AccountState {
    /// Balance that could be withdrawn right now.
    pub withdrawable: Decimal,
    /// Margin pledged against open positions.
    pub margin_in_use: Decimal,
    /// Total account equity (balance plus unrealized PnL).
    pub account_equity: Decimal,
}

impl AccountState {
    /// Margin usage as a fraction of equity (0 = idle, 1 = fully pledged).
    pub fn margin_usage(&self) -> Decimal {
        safe_div(self.margin_in_use, self.account_equity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ticker_mid() {
        let t = Ticker {
            symbol: "DOGEUSDT".into(),
            bid: dec!(0.0999),
            ask: dec!(0.1001),
        };
        assert_eq!(t.mid(), dec!(0.1000));
    }

    #[test]
    fn margin_usage_guards_zero_equity() {
        let a = AccountState {
            withdrawable: Decimal::ZERO,
            margin_in_use: dec!(100),
            account_equity: Decimal::ZERO,
        };
        assert_eq!(a.margin_usage(), Decimal::ZERO);
    }

    #[test]
    fn side_reversal() {
        assert_eq!(OrderSide::Buy.reversed(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.reversed(), OrderSide::Buy);
    }
}
