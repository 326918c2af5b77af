//! Binance REST gateway (spot + USD-M perpetuals).
//!
//! Queries retry throttles and 5xx with exponential backoff (base 1s, factor
//! 2, cap 60s, ±20% jitter) up to 5 attempts. Writes are retried only on a
//! throttle response, which proves the order was never accepted; any other
//! uncertain outcome surfaces as `AmbiguousWrite` for the order manager to
//! reconcile.

use crate::config::ExchangeConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::exchange::rate_limit::TokenBucket;
use crate::exchange::traits::ExchangeGateway;
use crate::exchange::types::{
    AccountState, Fill, FundingSnapshot, InstrumentRules, OrderSide, SymbolInfo, Ticker, Venue,
    Wallet,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";
const SPOT_BASE_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_QUERY_RETRIES: u32 = 5;
const BACKOFF_BASE_SECS: f64 = 1.0;
const BACKOFF_CAP_SECS: f64 = 60.0;

/// Taker fee fallback when the venue response carries no commission data.
const DEFAULT_TAKER_FEE: Decimal = dec!(0.0004);

/// Request rate budget: tokens per second and burst capacity.
const RATE_CAPACITY: u32 = 20;
const RATE_REFILL_PER_SEC: f64 = 10.0;

pub struct BinanceGateway {
    http: Client,
    api_key: String,
    secret_key: String,
    futures_base_url: String,
    spot_base_url: String,
    bucket: TokenBucket,
    rules_cache: RwLock<HashMap<(Venue, String), InstrumentRules>>,
}

impl BinanceGateway {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        let (futures_base_url, spot_base_url) = if config.testnet {
            (FUTURES_TESTNET_URL.to_string(), SPOT_TESTNET_URL.to_string())
        } else {
            (FUTURES_BASE_URL.to_string(), SPOT_BASE_URL.to_string())
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            futures_base_url,
            spot_base_url,
            bucket: TokenBucket::new(RATE_CAPACITY, RATE_REFILL_PER_SEC),
            rules_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    fn backoff_delay(attempt: u32) -> Duration {
        let base = BACKOFF_BASE_SECS * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(BACKOFF_CAP_SECS);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_secs_f64(capped * jitter)
    }

    fn signed_url(&self, base: &str, path: &str, params: &[(&str, String)]) -> String {
        let mut query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", Self::timestamp()));
        let signature = self.sign(&query);
        format!("{}{}?{}&signature={}", base, path, query, signature)
    }

    /// Classify an HTTP response the venue actually produced.
    async fn classify_response(response: reqwest::Response) -> GatewayError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.msg)
            .unwrap_or(body);

        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
                GatewayError::Transient(format!("throttled: {}", message))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Auth(message),
            s if s.is_server_error() => GatewayError::Transient(format!("{}: {}", s, message)),
            _ => GatewayError::Validation(format!("{}: {}", status, message)),
        }
    }

    fn classify_network(err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout(QUERY_TIMEOUT)
        } else {
            GatewayError::Transient(err.to_string())
        }
    }

    /// GET a public endpoint with query-retry semantics.
    async fn get_public<T: serde::de::DeserializeOwned>(&self, url: String) -> GatewayResult<T> {
        self.get_with_retry(|| url.clone(), false).await
    }

    /// GET a signed endpoint; the signature is rebuilt per attempt so the
    /// timestamp stays inside the venue's receive window across backoffs.
    async fn get_signed<T: serde::de::DeserializeOwned>(
        &self,
        base: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> GatewayResult<T> {
        self.get_with_retry(|| self.signed_url(base, path, params), true)
            .await
    }

    async fn get_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        make_url: impl Fn() -> String,
        signed: bool,
    ) -> GatewayResult<T> {
        let mut attempt = 0;
        loop {
            self.bucket.acquire().await;
            let url = make_url();
            let mut request = self.http.get(&url).timeout(QUERY_TIMEOUT);
            if signed {
                request = request.header("X-MBX-APIKEY", &self.api_key);
            }

            let err = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<T>().await {
                        Ok(value) => return Ok(value),
                        Err(e) => {
                            GatewayError::Validation(format!("unexpected response shape: {}", e))
                        }
                    }
                }
                Ok(response) => Self::classify_response(response).await,
                Err(e) => Self::classify_network(e),
            };

            if err.is_transient() && attempt < MAX_QUERY_RETRIES {
                attempt += 1;
                let delay = Self::backoff_delay(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "query retry");
                tokio::time::sleep(delay).await;
            } else {
                return Err(err);
            }
        }
    }

    /// POST a write. A throttle response proves the order was never accepted
    /// and is retried; network failures and 5xx surface as `AmbiguousWrite`.
    async fn post_signed<T: serde::de::DeserializeOwned>(
        &self,
        base: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> GatewayResult<T> {
        let mut attempt = 0;
        loop {
            self.bucket.acquire().await;
            let url = self.signed_url(base, path, params);
            let request = self
                .http
                .post(&url)
                .timeout(WRITE_TIMEOUT)
                .header("X-MBX-APIKEY", &self.api_key);

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response.json::<T>().await.map_err(|e| {
                        // The venue answered 200 but we cannot read the fill.
                        GatewayError::AmbiguousWrite(format!("unreadable fill response: {}", e))
                    });
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    if attempt >= MAX_QUERY_RETRIES {
                        return Err(GatewayError::Transient("throttle retries exhausted".into()));
                    }
                    attempt += 1;
                    let delay = Self::backoff_delay(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "write throttled, retrying");
                    tokio::time::sleep(delay).await;
                }
                Ok(response) if response.status().is_client_error() => {
                    // The venue refused before placement.
                    let err = Self::classify_response(response).await;
                    return Err(match err {
                        GatewayError::Auth(m) => GatewayError::Auth(m),
                        GatewayError::Validation(m) => GatewayError::RejectedPrePlace(m),
                        other => other,
                    });
                }
                Ok(response) => {
                    // 5xx on a write: the order may or may not have reached the engine.
                    let status = response.status();
                    return Err(GatewayError::AmbiguousWrite(format!("server error {}", status)));
                }
                Err(e) if e.is_timeout() => {
                    return Err(GatewayError::AmbiguousWrite(format!(
                        "no response within {:?}",
                        WRITE_TIMEOUT
                    )));
                }
                Err(e) => {
                    return Err(GatewayError::AmbiguousWrite(e.to_string()));
                }
            }
        }
    }

    async fn ensure_rules(&self, venue: Venue, symbol: &str) -> GatewayResult<InstrumentRules> {
        if let Some(rules) = self.rules_cache.read().await.get(&(venue, symbol.to_string())) {
            return Ok(*rules);
        }
        let rules = self.fetch_rules_uncached(venue, symbol).await?;
        self.rules_cache
            .write()
            .await
            .insert((venue, symbol.to_string()), rules);
        Ok(rules)
    }

    async fn fetch_rules_uncached(
        &self,
        venue: Venue,
        symbol: &str,
    ) -> GatewayResult<InstrumentRules> {
        let raw: ExchangeInfoRaw = match venue {
            Venue::Perp => {
                let url = format!("{}/fapi/v1/exchangeInfo", self.futures_base_url);
                self.get_public(url).await?
            }
            Venue::Spot => {
                let url = format!(
                    "{}/api/v3/exchangeInfo?symbol={}",
                    self.spot_base_url, symbol
                );
                self.get_public(url).await?
            }
        };

        let info = raw
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))?;

        let mut rules = InstrumentRules {
            min_qty: Decimal::ZERO,
            step_size: Decimal::ZERO,
            tick_size: Decimal::ZERO,
        };
        for filter in info.filters {
            match filter.filter_type.as_str() {
                "LOT_SIZE" => {
                    rules.min_qty = filter.min_qty.unwrap_or(Decimal::ZERO);
                    rules.step_size = filter.step_size.unwrap_or(Decimal::ZERO);
                }
                "PRICE_FILTER" => {
                    rules.tick_size = filter.tick_size.unwrap_or(Decimal::ZERO);
                }
                _ => {}
            }
        }

        if rules.step_size == Decimal::ZERO {
            return Err(GatewayError::Validation(format!(
                "no LOT_SIZE filter published for {}",
                symbol
            )));
        }
        Ok(rules)
    }
}

#[async_trait]
impl ExchangeGateway for BinanceGateway {
    #[instrument(skip(self))]
    async fn list_perp_symbols(&self) -> GatewayResult<Vec<SymbolInfo>> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.futures_base_url);
        let raw: ExchangeInfoRaw = self.get_public(url).await?;

        Ok(raw
            .symbols
            .into_iter()
            .filter(|s| {
                s.contract_type.as_deref() == Some("PERPETUAL")
                    && s.status.as_deref() == Some("TRADING")
            })
            .map(|s| SymbolInfo {
                symbol: s.symbol,
                base_asset: s.base_asset,
                quote_asset: s.quote_asset,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn fetch_funding_rate(&self, symbol: &str) -> GatewayResult<FundingSnapshot> {
        let url = format!(
            "{}/fapi/v1/premiumIndex?symbol={}",
            self.futures_base_url, symbol
        );
        let raw: PremiumIndexRaw = self.get_public(url).await?;
        Ok(FundingSnapshot {
            symbol: raw.symbol,
            predicted_rate: raw.last_funding_rate,
            next_funding_time: raw.next_funding_time,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_ticker(&self, venue: Venue, symbol: &str) -> GatewayResult<Ticker> {
        let url = match venue {
            Venue::Spot => format!(
                "{}/api/v3/ticker/bookTicker?symbol={}",
                self.spot_base_url, symbol
            ),
            Venue::Perp => format!(
                "{}/fapi/v1/ticker/bookTicker?symbol={}",
                self.futures_base_url, symbol
            ),
        };
        let raw: BookTickerRaw = self.get_public(url).await?;
        Ok(Ticker {
            symbol: raw.symbol,
            bid: raw.bid_price,
            ask: raw.ask_price,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_24h_volume(&self, symbol: &str) -> GatewayResult<Decimal> {
        let url = format!(
            "{}/fapi/v1/ticker/24hr?symbol={}",
            self.futures_base_url, symbol
        );
        let raw: Ticker24hRaw = self.get_public(url).await?;
        Ok(raw.quote_volume)
    }

    async fn fetch_instrument_rules(
        &self,
        venue: Venue,
        symbol: &str,
    ) -> GatewayResult<InstrumentRules> {
        self.ensure_rules(venue, symbol).await
    }

    #[instrument(skip(self))]
    async fn place_market_order(
        &self,
        venue: Venue,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> GatewayResult<Fill> {
        let rules = self.ensure_rules(venue, symbol).await?;
        if !crate::utils::decimal::conforms_to_step(quantity, rules.step_size) {
            return Err(GatewayError::InvalidQuantity {
                symbol: symbol.to_string(),
                quantity,
                step: rules.step_size,
            });
        }

        let side_str = match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side_str.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.to_string()),
            (
                "newOrderRespType",
                match venue {
                    Venue::Spot => "FULL".to_string(),
                    Venue::Perp => "RESULT".to_string(),
                },
            ),
        ];

        debug!(%venue, symbol, side = side_str, %quantity, "placing market order");

        match venue {
            Venue::Spot => {
                let raw: SpotOrderRaw = self
                    .post_signed(&self.spot_base_url, "/api/v3/order", &params)
                    .await?;
                let legs: Vec<(Decimal, Decimal)> = raw
                    .fills
                    .iter()
                    .map(|f| (f.price, f.qty))
                    .collect();
                let avg_price = crate::utils::decimal::weighted_average(&legs);
                let fee: Decimal = raw.fills.iter().map(|f| f.commission).sum();
                Ok(Fill {
                    symbol: raw.symbol,
                    side,
                    quantity: raw.executed_qty,
                    avg_price,
                    fee,
                })
            }
            Venue::Perp => {
                let raw: FuturesOrderRaw = self
                    .post_signed(&self.futures_base_url, "/fapi/v1/order", &params)
                    .await?;
                let fee = raw.avg_price * raw.executed_qty * DEFAULT_TAKER_FEE;
                Ok(Fill {
                    symbol: raw.symbol,
                    side,
                    quantity: raw.executed_qty,
                    avg_price: raw.avg_price,
                    fee,
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn transfer(
        &self,
        from: Wallet,
        to: Wallet,
        asset: &str,
        amount: Decimal,
    ) -> GatewayResult<()> {
        let transfer_type = match (from, to) {
            (Wallet::Spot, Wallet::Perp) => "MAIN_UMFUTURE",
            (Wallet::Perp, Wallet::Spot) => "UMFUTURE_MAIN",
            _ => {
                return Err(GatewayError::Validation(
                    "transfer requires distinct wallets".into(),
                ))
            }
        };
        let params = [
            ("type", transfer_type.to_string()),
            ("asset", asset.to_string()),
            ("amount", amount.to_string()),
        ];
        let _: TransferRaw = self
            .post_signed(&self.spot_base_url, "/sapi/v1/asset/transfer", &params)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_account(&self) -> GatewayResult<AccountState> {
        let raw: FuturesAccountRaw = self
            .get_signed(&self.futures_base_url, "/fapi/v2/account", &[])
            .await?;
        Ok(AccountState {
            withdrawable: raw.max_withdraw_amount,
            margin_in_use: raw.total_initial_margin,
            account_equity: raw.total_margin_balance,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_perp_position(&self, symbol: &str) -> GatewayResult<Decimal> {
        let raw: Vec<PositionRiskRaw> = self
            .get_signed(
                &self.futures_base_url,
                "/fapi/v2/positionRisk",
                &[("symbol", symbol.to_string())],
            )
            .await?;
        Ok(raw.iter().map(|p| p.position_amt).sum())
    }

    #[instrument(skip(self))]
    async fn fetch_spot_balance(&self, asset: &str) -> GatewayResult<Decimal> {
        let raw: SpotAccountRaw = self
            .get_signed(&self.spot_base_url, "/api/v3/account", &[])
            .await?;
        Ok(raw
            .balances
            .into_iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO))
    }
}

// ==================== Wire types ====================

#[derive(Debug, Deserialize)]
struct ApiError {
    #[allow(dead_code)]
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoRaw {
    symbols: Vec<ExchangeSymbolRaw>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeSymbolRaw {
    symbol: String,
    #[serde(default)]
    contract_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    filters: Vec<FilterRaw>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterRaw {
    filter_type: String,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    min_qty: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    step_size: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    tick_size: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndexRaw {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    last_funding_rate: Decimal,
    next_funding_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTickerRaw {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    bid_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    ask_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24hRaw {
    #[serde(with = "rust_decimal::serde::str")]
    quote_volume: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotOrderRaw {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    executed_qty: Decimal,
    #[serde(default)]
    fills: Vec<SpotFillRaw>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotFillRaw {
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    commission: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesOrderRaw {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    avg_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    executed_qty: Decimal,
}

#[derive(Debug, Deserialize)]
struct TransferRaw {
    #[allow(dead_code)]
    #[serde(rename = "tranId")]
    tran_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesAccountRaw {
    #[serde(with = "rust_decimal::serde::str")]
    total_initial_margin: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    total_margin_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    max_withdraw_amount: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskRaw {
    #[serde(with = "rust_decimal::serde::str")]
    position_amt: Decimal,
}

#[derive(Debug, Deserialize)]
struct SpotAccountRaw {
    balances: Vec<SpotBalanceRaw>,
}

#[derive(Debug, Deserialize)]
struct SpotBalanceRaw {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    free: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_sixty_seconds() {
        for attempt in 1..12 {
            let d = BinanceGateway::backoff_delay(attempt);
            assert!(d <= Duration::from_secs_f64(BACKOFF_CAP_SECS * 1.2));
        }
        // First retry centers on the 1s base.
        let first = BinanceGateway::backoff_delay(1);
        assert!(first >= Duration::from_secs_f64(0.8) && first <= Duration::from_secs_f64(1.2));
    }

    #[test]
    fn order_fill_parsing() {
        let raw: SpotOrderRaw = serde_json::from_str(
            r#"{"symbol":"DOGEUSDT","executedQty":"10000","fills":[
                {"price":"0.10","qty":"6000","commission":"0.6"},
                {"price":"0.11","qty":"4000","commission":"0.44"}]}"#,
        )
        .unwrap();
        assert_eq!(raw.executed_qty, Decimal::from(10000));
        assert_eq!(raw.fills.len(), 2);
    }

    #[test]
    fn account_snapshot_parsing() {
        let raw: FuturesAccountRaw = serde_json::from_str(
            r#"{"totalInitialMargin":"400.0","totalMarginBalance":"1000.0","maxWithdrawAmount":"550.0"}"#,
        )
        .unwrap();
        assert_eq!(raw.total_initial_margin, Decimal::from(400));
        assert_eq!(raw.max_withdraw_amount, Decimal::from(550));
    }
}
