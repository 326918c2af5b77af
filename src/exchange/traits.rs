//! Venue-agnostic gateway trait.
//!
//! One implementation per exchange; the rest of the system only sees this
//! facade. Queries are idempotent and internally retried; writes surface
//! their outcome (including ambiguity) without retrying, so the order
//! manager stays in charge of recovery.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::GatewayResult;
use crate::exchange::types::{
    AccountState, Fill, FundingSnapshot, InstrumentRules, OrderSide, SymbolInfo, Ticker, Venue,
    Wallet,
};

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// All perpetual pairs currently tradable on the venue.
    async fn list_perp_symbols(&self) -> GatewayResult<Vec<SymbolInfo>>;

    /// Predicted funding rate for the next interval.
    async fn fetch_funding_rate(&self, symbol: &str) -> GatewayResult<FundingSnapshot>;

    /// Best bid/ask on the given venue side.
    async fn fetch_ticker(&self, venue: Venue, symbol: &str) -> GatewayResult<Ticker>;

    /// 24-hour quote-denominated volume of the perpetual.
    async fn fetch_24h_volume(&self, symbol: &str) -> GatewayResult<Decimal>;

    /// Trading constraints (min size, step size, tick size).
    async fn fetch_instrument_rules(
        &self,
        venue: Venue,
        symbol: &str,
    ) -> GatewayResult<InstrumentRules>;

    /// Place a taker order. The quantity must already conform to the
    /// instrument's step size; non-conforming input is rejected with
    /// `INVALID_QUANTITY` rather than silently rounded.
    async fn place_market_order(
        &self,
        venue: Venue,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> GatewayResult<Fill>;

    /// Move `amount` of `asset` between the venue's internal wallets.
    async fn transfer(
        &self,
        from: Wallet,
        to: Wallet,
        asset: &str,
        amount: Decimal,
    ) -> GatewayResult<()>;

    /// Full snapshot of the perpetual account.
    async fn fetch_account(&self) -> GatewayResult<AccountState>;

    /// Signed net perpetual position for `symbol` (negative = short).
    async fn fetch_perp_position(&self, symbol: &str) -> GatewayResult<Decimal>;

    /// Free spot-wallet balance of `asset`.
    async fn fetch_spot_balance(&self, asset: &str) -> GatewayResult<Decimal>;
}
