//! Scriptable in-memory gateway for tests.
//!
//! Market data, balances and per-order behaviors are injected up front; the
//! mock then answers the full [`ExchangeGateway`] surface and records every
//! order and transfer for assertions.

use crate::error::{GatewayError, GatewayResult};
use crate::exchange::traits::ExchangeGateway;
use crate::exchange::types::{
    AccountState, Fill, FundingSnapshot, InstrumentRules, OrderSide, SymbolInfo, Ticker, Venue,
    Wallet,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// How the next market order on a `(venue, symbol)` behaves.
#[derive(Debug, Clone)]
pub enum OrderBehavior {
    /// Fill at the current ticker mid.
    Fill,
    /// Fill at the current ticker mid, but only for this fraction of the
    /// requested quantity (models a partial fill on one leg).
    PartialFill(Decimal),
    /// Refuse before placement.
    RejectPrePlace(String),
    /// Return `AmbiguousWrite`; `applied` controls whether the order actually
    /// reached the book (what reconciliation polling will observe).
    Ambiguous { applied: bool },
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub venue: Venue,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub from: Wallet,
    pub to: Wallet,
    pub asset: String,
    pub amount: Decimal,
}

#[derive(Debug, Default)]
struct MockState {
    symbols: Vec<SymbolInfo>,
    rules: HashMap<(Venue, String), InstrumentRules>,
    tickers: HashMap<(Venue, String), Ticker>,
    funding: HashMap<String, Decimal>,
    funding_seq: HashMap<String, VecDeque<Decimal>>,
    volumes: HashMap<String, Decimal>,
    spot_balances: HashMap<String, Decimal>,
    perp_positions: HashMap<String, Decimal>,
    account: Option<AccountState>,
    account_seq: VecDeque<AccountState>,
    behaviors: HashMap<(Venue, String), VecDeque<OrderBehavior>>,
    failing: HashSet<String>,
    orders: Vec<PlacedOrder>,
    transfers: Vec<TransferRecord>,
}

#[derive(Clone)]
pub struct MockGateway {
    state: Arc<RwLock<MockState>>,
    fee_rate: Decimal,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
            fee_rate: dec!(0.0004),
        }
    }

    /// List a pair with identical prices on both venues and sane defaults.
    pub async fn list_pair(
        &self,
        symbol: &str,
        base: &str,
        quote: &str,
        spot_price: Decimal,
        perp_price: Decimal,
    ) {
        let mut state = self.state.write().await;
        state.symbols.push(SymbolInfo {
            symbol: symbol.to_string(),
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
        });
        let rules = InstrumentRules {
            min_qty: Decimal::ONE,
            step_size: Decimal::ONE,
            tick_size: dec!(0.0001),
        };
        for venue in [Venue::Spot, Venue::Perp] {
            state.rules.insert((venue, symbol.to_string()), rules);
        }
        state.tickers.insert(
            (Venue::Spot, symbol.to_string()),
            Ticker {
                symbol: symbol.to_string(),
                bid: spot_price,
                ask: spot_price,
            },
        );
        state.tickers.insert(
            (Venue::Perp, symbol.to_string()),
            Ticker {
                symbol: symbol.to_string(),
                bid: perp_price,
                ask: perp_price,
            },
        );
        state.funding.insert(symbol.to_string(), Decimal::ZERO);
        state.volumes.insert(symbol.to_string(), Decimal::ZERO);
    }

    pub async fn set_rules(&self, venue: Venue, symbol: &str, rules: InstrumentRules) {
        self.state
            .write()
            .await
            .rules
            .insert((venue, symbol.to_string()), rules);
    }

    pub async fn set_funding(&self, symbol: &str, rate: Decimal) {
        self.state
            .write()
            .await
            .funding
            .insert(symbol.to_string(), rate);
    }

    /// Queue a sequence of funding samples; each fetch pops one, the last
    /// value sticks once the queue is dry.
    pub async fn push_funding_sequence(&self, symbol: &str, rates: &[Decimal]) {
        self.state
            .write()
            .await
            .funding_seq
            .entry(symbol.to_string())
            .or_default()
            .extend(rates.iter().copied());
    }

    pub async fn set_volume(&self, symbol: &str, volume: Decimal) {
        self.state
            .write()
            .await
            .volumes
            .insert(symbol.to_string(), volume);
    }

    pub async fn set_prices(&self, symbol: &str, spot: Decimal, perp: Decimal) {
        let mut state = self.state.write().await;
        state.tickers.insert(
            (Venue::Spot, symbol.to_string()),
            Ticker {
                symbol: symbol.to_string(),
                bid: spot,
                ask: spot,
            },
        );
        state.tickers.insert(
            (Venue::Perp, symbol.to_string()),
            Ticker {
                symbol: symbol.to_string(),
                bid: perp,
                ask: perp,
            },
        );
    }

    pub async fn set_spot_balance(&self, asset: &str, amount: Decimal) {
        self.state
            .write()
            .await
            .spot_balances
            .insert(asset.to_string(), amount);
    }

    pub async fn set_perp_position(&self, symbol: &str, amount: Decimal) {
        self.state
            .write()
            .await
            .perp_positions
            .insert(symbol.to_string(), amount);
    }

    pub async fn set_account(&self, account: AccountState) {
        self.state.write().await.account = Some(account);
    }

    /// Queue account snapshots; each fetch pops one, the last sticks.
    pub async fn push_account_sequence(&self, snapshots: &[AccountState]) {
        self.state
            .write()
            .await
            .account_seq
            .extend(snapshots.iter().copied());
    }

    pub async fn push_order_behavior(&self, venue: Venue, symbol: &str, behavior: OrderBehavior) {
        self.state
            .write()
            .await
            .behaviors
            .entry((venue, symbol.to_string()))
            .or_default()
            .push_back(behavior);
    }

    /// Make all market-data queries for `symbol` fail with a transient error.
    pub async fn set_market_data_failing(&self, symbol: &str, failing: bool) {
        let mut state = self.state.write().await;
        if failing {
            state.failing.insert(symbol.to_string());
        } else {
            state.failing.remove(symbol);
        }
    }

    pub async fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.state.read().await.orders.clone()
    }

    pub async fn transfers(&self) -> Vec<TransferRecord> {
        self.state.read().await.transfers.clone()
    }

    pub async fn spot_balance(&self, asset: &str) -> Decimal {
        self.state
            .read()
            .await
            .spot_balances
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn perp_position(&self, symbol: &str) -> Decimal {
        self.state
            .read()
            .await
            .perp_positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn base_asset(state: &MockState, symbol: &str) -> String {
        state
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .map(|s| s.base_asset.clone())
            .unwrap_or_else(|| symbol.trim_end_matches("USDT").to_string())
    }

    fn apply_fill(state: &mut MockState, venue: Venue, symbol: &str, side: OrderSide, qty: Decimal) {
        match venue {
            Venue::Spot => {
                let base = Self::base_asset(state, symbol);
                let entry = state.spot_balances.entry(base).or_insert(Decimal::ZERO);
                match side {
                    OrderSide::Buy => *entry += qty,
                    OrderSide::Sell => *entry -= qty,
                }
            }
            Venue::Perp => {
                let entry = state
                    .perp_positions
                    .entry(symbol.to_string())
                    .or_insert(Decimal::ZERO);
                match side {
                    OrderSide::Buy => *entry += qty,
                    OrderSide::Sell => *entry -= qty,
                }
            }
        }
    }

    fn transient(symbol: &str) -> GatewayError {
        GatewayError::Transient(format!("scripted market-data failure for {}", symbol))
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn list_perp_symbols(&self) -> GatewayResult<Vec<SymbolInfo>> {
        Ok(self.state.read().await.symbols.clone())
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> GatewayResult<FundingSnapshot> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.failing.contains(symbol) {
            return Err(Self::transient(symbol));
        }
        if let Some(next) = state
            .funding_seq
            .get_mut(symbol)
            .and_then(|seq| seq.pop_front())
        {
            state.funding.insert(symbol.to_string(), next);
        }
        let rate = state
            .funding
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))?;
        Ok(FundingSnapshot {
            symbol: symbol.to_string(),
            predicted_rate: rate,
            next_funding_time: 0,
        })
    }

    async fn fetch_ticker(&self, venue: Venue, symbol: &str) -> GatewayResult<Ticker> {
        let state = self.state.read().await;
        if state.failing.contains(symbol) {
            return Err(Self::transient(symbol));
        }
        state
            .tickers
            .get(&(venue, symbol.to_string()))
            .cloned()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))
    }

    async fn fetch_24h_volume(&self, symbol: &str) -> GatewayResult<Decimal> {
        let state = self.state.read().await;
        if state.failing.contains(symbol) {
            return Err(Self::transient(symbol));
        }
        state
            .volumes
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))
    }

    async fn fetch_instrument_rules(
        &self,
        venue: Venue,
        symbol: &str,
    ) -> GatewayResult<InstrumentRules> {
        self.state
            .read()
            .await
            .rules
            .get(&(venue, symbol.to_string()))
            .copied()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))
    }

    async fn place_market_order(
        &self,
        venue: Venue,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> GatewayResult<Fill> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let rules = state
            .rules
            .get(&(venue, symbol.to_string()))
            .copied()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))?;
        if !crate::utils::decimal::conforms_to_step(quantity, rules.step_size) {
            return Err(GatewayError::InvalidQuantity {
                symbol: symbol.to_string(),
                quantity,
                step: rules.step_size,
            });
        }

        let behavior = state
            .behaviors
            .get_mut(&(venue, symbol.to_string()))
            .and_then(|q| q.pop_front())
            .unwrap_or(OrderBehavior::Fill);

        let price = state
            .tickers
            .get(&(venue, symbol.to_string()))
            .map(|t| t.mid())
            .unwrap_or(Decimal::ONE);

        match behavior {
            OrderBehavior::RejectPrePlace(reason) => Err(GatewayError::RejectedPrePlace(reason)),
            OrderBehavior::Ambiguous { applied } => {
                if applied {
                    Self::apply_fill(state, venue, symbol, side, quantity);
                    state.orders.push(PlacedOrder {
                        venue,
                        symbol: symbol.to_string(),
                        side,
                        quantity,
                        price,
                    });
                }
                Err(GatewayError::AmbiguousWrite("scripted ambiguity".into()))
            }
            fill_behavior => {
                let filled = match fill_behavior {
                    OrderBehavior::PartialFill(fraction) => {
                        crate::utils::decimal::floor_to_step(quantity * fraction, rules.step_size)
                    }
                    _ => quantity,
                };
                Self::apply_fill(state, venue, symbol, side, filled);
                state.orders.push(PlacedOrder {
                    venue,
                    symbol: symbol.to_string(),
                    side,
                    quantity: filled,
                    price,
                });
                Ok(Fill {
                    symbol: symbol.to_string(),
                    side,
                    quantity: filled,
                    avg_price: price,
                    fee: filled * price * self.fee_rate,
                })
            }
        }
    }

    async fn transfer(
        &self,
        from: Wallet,
        to: Wallet,
        asset: &str,
        amount: Decimal,
    ) -> GatewayResult<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if from == Wallet::Spot {
            let balance = state
                .spot_balances
                .entry(asset.to_string())
                .or_insert(Decimal::ZERO);
            if *balance < amount {
                return Err(GatewayError::Validation(format!(
                    "insufficient {} in spot wallet",
                    asset
                )));
            }
            *balance -= amount;
            if let Some(account) = state.account.as_mut() {
                account.account_equity += amount;
                account.withdrawable += amount;
            }
        } else if let Some(account) = state.account.as_mut() {
            account.account_equity -= amount;
            account.withdrawable -= amount;
            *state
                .spot_balances
                .entry(asset.to_string())
                .or_insert(Decimal::ZERO) += amount;
        }
        state.transfers.push(TransferRecord {
            from,
            to,
            asset: asset.to_string(),
            amount,
        });
        Ok(())
    }

    async fn fetch_account(&self) -> GatewayResult<AccountState> {
        let mut state = self.state.write().await;
        if let Some(next) = state.account_seq.pop_front() {
            state.account = Some(next);
        }
        state
            .account
            .ok_or_else(|| GatewayError::Auth("no account configured".into()))
    }

    async fn fetch_perp_position(&self, symbol: &str) -> GatewayResult<Decimal> {
        Ok(self
            .state
            .read()
            .await
            .perp_positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn fetch_spot_balance(&self, asset: &str) -> GatewayResult<Decimal> {
        Ok(self
            .state
            .read()
            .await
            .spot_balances
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }
}
