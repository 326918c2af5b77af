//! Market scanner for ranking cash-and-carry candidates.

use crate::config::EntryConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::exchange::{ExchangeGateway, Venue};
use crate::utils::decimal::safe_div;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

/// Snapshots older than this many scanner ticks are silently omitted.
const MAX_SNAPSHOT_AGE_TICKS: u64 = 2;

/// One symbol's market state at one instant.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    /// Predicted funding rate for the next interval.
    pub funding_rate: Decimal,
    pub spot_mid: Decimal,
    pub perp_mark: Decimal,
    /// 24-hour quote-denominated volume.
    pub volume_24h: Decimal,
    /// `(perp - spot) / spot`; positive = contango.
    pub spread: Decimal,
}

impl MarketSnapshot {
    pub fn compute(
        symbol: String,
        funding_rate: Decimal,
        spot_mid: Decimal,
        perp_mark: Decimal,
        volume_24h: Decimal,
    ) -> Option<Self> {
        if spot_mid <= Decimal::ZERO {
            return None;
        }
        let spread = safe_div(perp_mark - spot_mid, spot_mid);
        Some(Self {
            symbol,
            funding_rate,
            spot_mid,
            perp_mark,
            volume_24h,
            spread,
        })
    }
}

/// A snapshot that has passed every entry filter.
pub type TargetCandidate = MarketSnapshot;

struct CachedSnapshot {
    snapshot: MarketSnapshot,
    tick: u64,
}

/// Periodically ranks the symbol universe and emits entry candidates.
///
/// Stateless between ticks except for a per-symbol last-good snapshot cache
/// used to ride out transient data failures.
pub struct MarketScanner {
    config: EntryConfig,
    cache: HashMap<String, CachedSnapshot>,
    tick: u64,
}

impl MarketScanner {
    pub fn new(config: EntryConfig) -> Self {
        Self {
            config,
            cache: HashMap::new(),
            tick: 0,
        }
    }

    /// Scan once. Per-symbol failures skip that symbol; an empty result is a
    /// valid outcome, never an error.
    #[instrument(skip(self, gateway))]
    pub async fn scan(&mut self, gateway: &dyn ExchangeGateway) -> Vec<TargetCandidate> {
        self.tick += 1;

        let symbols = match gateway.list_perp_symbols().await {
            Ok(symbols) => symbols,
            Err(e) => {
                warn!(error = %e, "symbol listing failed, serving cached snapshots");
                Vec::new()
            }
        };

        let eligible: Vec<String> = symbols
            .into_iter()
            .filter(|s| s.quote_asset == self.config.quote_currency)
            .map(|s| s.symbol)
            .collect();

        let fetches = eligible
            .iter()
            .map(|symbol| Self::fetch_snapshot(gateway, symbol));
        let results = join_all(fetches).await;

        for (symbol, result) in eligible.iter().zip(results) {
            match result {
                Ok(snapshot) => {
                    self.cache.insert(
                        symbol.clone(),
                        CachedSnapshot {
                            snapshot,
                            tick: self.tick,
                        },
                    );
                }
                Err(e) => {
                    debug!(symbol, error = %e, "market data unavailable this tick");
                }
            }
        }

        // Drop anything that has gone stale so delisted symbols age out.
        let tick = self.tick;
        self.cache
            .retain(|_, cached| tick - cached.tick <= MAX_SNAPSHOT_AGE_TICKS);

        let mut candidates: Vec<TargetCandidate> = self
            .cache
            .values()
            .map(|cached| cached.snapshot.clone())
            .filter(|snapshot| self.passes_filters(snapshot))
            .collect();

        candidates.sort_by(compare_candidates);

        info!(
            tick = self.tick,
            universe = eligible.len(),
            candidates = candidates.len(),
            "scan complete"
        );
        candidates
    }

    async fn fetch_snapshot(
        gateway: &dyn ExchangeGateway,
        symbol: &str,
    ) -> GatewayResult<MarketSnapshot> {
        let (funding, spot, perp, volume) = tokio::try_join!(
            gateway.fetch_funding_rate(symbol),
            gateway.fetch_ticker(Venue::Spot, symbol),
            gateway.fetch_ticker(Venue::Perp, symbol),
            gateway.fetch_24h_volume(symbol),
        )?;

        MarketSnapshot::compute(
            symbol.to_string(),
            funding.predicted_rate,
            spot.mid(),
            perp.mid(),
            volume,
        )
        .ok_or_else(|| GatewayError::Validation(format!("non-positive spot mid for {}", symbol)))
    }

    /// All four entry criteria must hold.
    fn passes_filters(&self, snapshot: &MarketSnapshot) -> bool {
        snapshot.funding_rate >= self.config.min_funding_rate
            && snapshot.volume_24h >= self.config.min_volume_24h
            && snapshot.spread >= self.config.min_spread
            && snapshot.spread > Decimal::ZERO
    }
}

/// Funding rate descending, then 24h volume descending, then symbol.
fn compare_candidates(a: &TargetCandidate, b: &TargetCandidate) -> Ordering {
    b.funding_rate
        .cmp(&a.funding_rate)
        .then_with(|| b.volume_24h.cmp(&a.volume_24h))
        .then_with(|| a.symbol.cmp(&b.symbol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockGateway;
    use rust_decimal_macros::dec;

    fn scanner() -> MarketScanner {
        MarketScanner::new(EntryConfig::default())
    }

    async fn gateway_with(pairs: &[(&str, Decimal, Decimal, Decimal, Decimal)]) -> MockGateway {
        let gateway = MockGateway::new();
        for (symbol, funding, spot, perp, volume) in pairs {
            let base = symbol.trim_end_matches("USDT");
            gateway.list_pair(symbol, base, "USDT", *spot, *perp).await;
            gateway.set_funding(symbol, *funding).await;
            gateway.set_volume(symbol, *volume).await;
        }
        gateway
    }

    #[tokio::test]
    async fn ranks_by_funding_then_volume_then_symbol() {
        let gateway = gateway_with(&[
            ("AAAUSDT", dec!(0.0004), dec!(1.0), dec!(1.003), dec!(20_000_000)),
            ("BBBUSDT", dec!(0.0006), dec!(1.0), dec!(1.003), dec!(20_000_000)),
            ("CCCUSDT", dec!(0.0004), dec!(1.0), dec!(1.003), dec!(30_000_000)),
            ("DDDUSDT", dec!(0.0004), dec!(1.0), dec!(1.003), dec!(20_000_000)),
        ])
        .await;

        let mut scanner = scanner();
        let first = scanner.scan(&gateway).await;
        let order: Vec<&str> = first.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(order, vec!["BBBUSDT", "CCCUSDT", "AAAUSDT", "DDDUSDT"]);

        // Same inputs produce the same ordering.
        let second = scanner.scan(&gateway).await;
        let again: Vec<&str> = second.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(order, again);
    }

    #[tokio::test]
    async fn threshold_boundaries_are_inclusive() {
        let gateway = gateway_with(&[(
            "EDGUSDT",
            dec!(0.0003),
            dec!(1.000),
            dec!(1.002),
            dec!(10_000_000),
        )])
        .await;

        let candidates = scanner().scan(&gateway).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].spread, dec!(0.002));
    }

    #[tokio::test]
    async fn below_threshold_symbols_are_filtered() {
        let gateway = gateway_with(&[
            // Funding just under the floor.
            ("AAAUSDT", dec!(0.00029), dec!(1.0), dec!(1.003), dec!(20_000_000)),
            // Backwardation: spread negative.
            ("BBBUSDT", dec!(0.0005), dec!(1.0), dec!(0.995), dec!(20_000_000)),
            // Thin volume.
            ("CCCUSDT", dec!(0.0005), dec!(1.0), dec!(1.003), dec!(9_999_999)),
        ])
        .await;

        assert!(scanner().scan(&gateway).await.is_empty());
    }

    #[tokio::test]
    async fn wrong_quote_currency_is_ignored() {
        let gateway = MockGateway::new();
        gateway
            .list_pair("ETHBTC", "ETH", "BTC", dec!(0.05), dec!(0.0502))
            .await;
        gateway.set_funding("ETHBTC", dec!(0.001)).await;
        gateway.set_volume("ETHBTC", dec!(50_000_000)).await;

        assert!(scanner().scan(&gateway).await.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_serves_cache_then_goes_stale() {
        let gateway = gateway_with(&[(
            "DOGUSDT",
            dec!(0.0004),
            dec!(0.10),
            dec!(0.1003),
            dec!(20_000_000),
        )])
        .await;

        let mut scanner = scanner();
        assert_eq!(scanner.scan(&gateway).await.len(), 1);

        // Two failing ticks still serve the cached snapshot.
        gateway.set_market_data_failing("DOGUSDT", true).await;
        assert_eq!(scanner.scan(&gateway).await.len(), 1);
        assert_eq!(scanner.scan(&gateway).await.len(), 1);

        // Third failing tick: data is older than two ticks, omitted silently.
        assert!(scanner.scan(&gateway).await.is_empty());
    }
}
