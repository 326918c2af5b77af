//! Error taxonomy shared by the gateway and the order path.

use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by an [`crate::exchange::ExchangeGateway`].
///
/// Queries retry transient failures internally; writes never retry on an
/// unknown outcome and instead surface [`GatewayError::AmbiguousWrite`] so the
/// order manager can reconcile.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Throttling, timeouts, 5xx. Retried internally for queries; a write
    /// seeing this after placement attempt becomes [`Self::AmbiguousWrite`].
    #[error("transient exchange failure: {0}")]
    Transient(String),

    /// The request deadline elapsed with no response.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The venue refused the request on its parameters (bad symbol, bad
    /// notional, filter violation). Never retried.
    #[error("validation rejected: {0}")]
    Validation(String),

    /// A submitted quantity does not conform to the instrument's step size.
    #[error("quantity {quantity} does not conform to step {step} for {symbol}")]
    InvalidQuantity {
        symbol: String,
        quantity: Decimal,
        step: Decimal,
    },

    /// The venue provably refused the order before placement. Safe to treat
    /// as "did not happen".
    #[error("order rejected before placement: {0}")]
    RejectedPrePlace(String),

    /// A write whose outcome is unknown (connection dropped mid-flight,
    /// ambiguous status). The caller must reconcile by polling.
    #[error("write outcome unknown: {0}")]
    AmbiguousWrite(String),

    /// Credentials rejected. Unrecoverable; the process exits with code 1.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The symbol is not listed on the venue.
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
}

impl GatewayError {
    /// Whether this error proves the write was never accepted by the venue,
    /// which makes it safe to treat the leg as not placed.
    pub fn proves_not_placed(&self) -> bool {
        matches!(
            self,
            GatewayError::Validation(_)
                | GatewayError::InvalidQuantity { .. }
                | GatewayError::RejectedPrePlace(_)
                | GatewayError::UnknownSymbol(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_) | GatewayError::Timeout(_))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced by the order manager's compound operations.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The requested notional floors below the venue minimum quantity.
    #[error("notional {notional} for {symbol} floors below the minimum tradable quantity")]
    InsufficientNotional { symbol: String, notional: Decimal },

    /// A state the executor cannot resolve within bounded time. Engages the
    /// global entry halt; the process exits with code 2.
    #[error("manual intervention required for {symbol}: {reason}")]
    ManualIntervention { symbol: String, reason: String },

    /// New entries are rejected while the kill switch or entry halt is set.
    #[error("entries are halted")]
    EntriesHalted,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub type ExecResult<T> = Result<T, ExecError>;
