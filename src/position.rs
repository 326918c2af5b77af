//! Durable record of an entered cash-and-carry leg pair.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Lifecycle state. Transitions only move forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PositionError> {
        match s {
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSING" => Ok(PositionStatus::Closing),
            "CLOSED" => Ok(PositionStatus::Closed),
            other => Err(PositionError::UnknownStatus(other.to_string())),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            PositionStatus::Open => 0,
            PositionStatus::Closing => 1,
            PositionStatus::Closed => 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("position quantities must be positive")]
    NonPositiveQuantity,

    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("unknown position status {0:?}")]
    UnknownStatus(String),
}

/// One live delta-neutral pair: long spot, short perpetual.
///
/// While `Open`, `spot_qty` and `perp_qty` stay equal within the symbol's
/// step size; both only shrink together through coordinated partial closes.
#[derive(Debug, Clone)]
pub struct ActivePosition {
    pub id: String,
    pub symbol: String,
    pub entered_at: DateTime<Utc>,
    pub spot_qty: Decimal,
    pub perp_qty: Decimal,
    /// Weighted-average spread at entry, `(perp - spot) / spot`.
    pub entry_spread: Decimal,
    /// Cumulative fees paid, quote currency.
    pub total_fees: Decimal,
    pub status: PositionStatus,
}

impl ActivePosition {
    pub fn open(
        symbol: &str,
        spot_qty: Decimal,
        perp_qty: Decimal,
        entry_spread: Decimal,
        total_fees: Decimal,
    ) -> Result<Self, PositionError> {
        if spot_qty <= Decimal::ZERO || perp_qty <= Decimal::ZERO {
            return Err(PositionError::NonPositiveQuantity);
        }
        let entered_at = Utc::now();
        Ok(Self {
            id: format!("{}-{}", symbol.to_lowercase(), entered_at.timestamp_millis()),
            symbol: symbol.to_string(),
            entered_at,
            spot_qty,
            perp_qty,
            entry_spread,
            total_fees,
            status: PositionStatus::Open,
        })
    }

    /// Reconstruct a persisted row without re-running entry validation.
    #[allow(clippy::too_many_arguments)]
    pub fn from_stored(
        id: String,
        symbol: String,
        entered_at: DateTime<Utc>,
        spot_qty: Decimal,
        perp_qty: Decimal,
        entry_spread: Decimal,
        total_fees: Decimal,
        status: PositionStatus,
    ) -> Self {
        Self {
            id,
            symbol,
            entered_at,
            spot_qty,
            perp_qty,
            entry_spread,
            total_fees,
            status,
        }
    }

    /// Advance the lifecycle. Backward moves and repeats are rejected.
    pub fn transition(&mut self, to: PositionStatus) -> Result<(), PositionError> {
        if to.rank() <= self.status.rank() {
            return Err(PositionError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Shrink both legs after a coordinated partial close.
    pub fn reduce(
        &mut self,
        new_spot_qty: Decimal,
        new_perp_qty: Decimal,
        added_fees: Decimal,
    ) -> Result<(), PositionError> {
        if new_spot_qty <= Decimal::ZERO || new_perp_qty <= Decimal::ZERO {
            return Err(PositionError::NonPositiveQuantity);
        }
        self.spot_qty = new_spot_qty;
        self.perp_qty = new_perp_qty;
        self.total_fees += added_fees;
        Ok(())
    }

    pub fn legs_balanced(&self, step: Decimal) -> bool {
        (self.spot_qty - self.perp_qty).abs() <= step
    }
}
