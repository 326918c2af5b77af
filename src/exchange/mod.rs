//! Exchange integration.
//!
//! One gateway implementation per venue behind the [`ExchangeGateway`]
//! trait: rate limiting, signing, retry policy and the error taxonomy all
//! live here so the trading core never sees raw HTTP.

mod binance;
pub mod mock;
mod rate_limit;
mod traits;
mod types;

pub use binance::BinanceGateway;
pub use mock::MockGateway;
pub use rate_limit::TokenBucket;
pub use traits::ExchangeGateway;
pub use types::*;
