//! Atomic two-leg order execution.
//!
//! Every compound operation here ends in one of two states: a balanced
//! long-spot/short-perp pair exists, or no exchange-side position
//! attributable to the call exists. Single-leg failures are recovered by
//! reversing the filled leg; unknown outcomes are reconciled by polling the
//! venue; anything unresolvable within the hard cap raises manual
//! intervention and halts new entries globally.

use crate::error::{ExecError, ExecResult, GatewayError};
use crate::exchange::{ExchangeGateway, Fill, OrderSide, Venue};
use crate::position::ActivePosition;
use crate::shutdown::KillSwitch;
use crate::telemetry::{self, ExitType};
use crate::utils::decimal::{floor_to_step, safe_div, weighted_average};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Fee estimate used when a reconciled leg has no venue-reported commission.
const ESTIMATED_TAKER_FEE: Decimal = dec!(0.0004);

/// Deadlines and retry counts for compound operations. Defaults are the
/// production values; tests shrink them.
#[derive(Debug, Clone)]
pub struct ExecTimings {
    /// Wall-clock cap per dispatched leg.
    pub leg_timeout: Duration,
    /// Spacing of reconciliation polls.
    pub poll_interval: Duration,
    /// How long a leg may stay unconfirmed before it is judged unfilled.
    pub poll_budget: Duration,
    /// Hard cap on reconciling one compound operation.
    pub ambiguity_cap: Duration,
    /// Base delay between exit attempts (doubles per attempt).
    pub exit_backoff: Duration,
    /// Full-exit attempts before escalation.
    pub exit_attempts: u32,
}

impl Default for ExecTimings {
    fn default() -> Self {
        Self {
            leg_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            poll_budget: Duration::from_secs(5),
            ambiguity_cap: Duration::from_secs(30),
            exit_backoff: Duration::from_secs(1),
            exit_attempts: 3,
        }
    }
}

/// Which leg of a compound trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Spot,
    Perp,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Leg::Spot => "spot",
            Leg::Perp => "perp",
        }
    }
}

/// How a single dispatched leg ended.
#[derive(Debug)]
enum LegOutcome {
    Filled(Fill),
    /// Provably never placed.
    Rejected(String),
    /// Outcome unknown; must be reconciled by polling.
    Ambiguous(String),
}

/// Result of a two-leg entry attempt.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// Both legs filled; a balanced position now exists.
    BothFilled(ActivePosition),
    /// One leg filled and was reversed at market.
    OneLegOrphaned { leg: Leg, recovered: bool },
    /// Neither leg reached the venue.
    BothFailed,
}

/// Fills from a completed two-leg close (full exit or partial reduce).
#[derive(Debug)]
pub struct CloseSummary {
    pub spot_fill: Fill,
    pub perp_fill: Fill,
}

impl CloseSummary {
    pub fn fees(&self) -> Decimal {
        self.spot_fill.fee + self.perp_fill.fee
    }
}

/// What a reconciliation probe concluded about one ambiguous leg.
enum ProbeVerdict {
    Filled,
    Unfilled,
    /// Observation matches neither baseline nor target; carries the value.
    Diverged(Decimal),
}

enum ProbeTarget {
    PerpPosition,
    SpotBalance(String),
}

/// Executes entries, exits and coordinated reductions. Owns no position
/// state between calls; callers persist the outcome.
pub struct OrderManager {
    gateway: Arc<dyn ExchangeGateway>,
    quote_currency: String,
    timings: ExecTimings,
    symbol_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    entries_halted: Arc<AtomicBool>,
    kill: KillSwitch,
}

impl OrderManager {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, quote_currency: &str, kill: KillSwitch) -> Self {
        Self::with_timings(gateway, quote_currency, kill, ExecTimings::default())
    }

    pub fn with_timings(
        gateway: Arc<dyn ExchangeGateway>,
        quote_currency: &str,
        kill: KillSwitch,
        timings: ExecTimings,
    ) -> Self {
        Self {
            gateway,
            quote_currency: quote_currency.to_string(),
            timings,
            symbol_locks: Mutex::new(HashMap::new()),
            entries_halted: Arc::new(AtomicBool::new(false)),
            kill,
        }
    }

    /// Whether a manual-intervention state has stopped new entries.
    pub fn entries_halted(&self) -> bool {
        self.entries_halted.load(Ordering::SeqCst)
    }

    fn base_asset(&self, symbol: &str) -> String {
        symbol
            .strip_suffix(self.quote_currency.as_str())
            .unwrap_or(symbol)
            .to_string()
    }

    async fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.symbol_locks
            .lock()
            .await
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn manual(&self, symbol: &str, reason: impl Into<String>) -> ExecError {
        let reason = reason.into();
        self.entries_halted.store(true, Ordering::SeqCst);
        telemetry::manual_intervention(symbol, &reason);
        error!(symbol, reason, "manual intervention raised, entries halted");
        ExecError::ManualIntervention {
            symbol: symbol.to_string(),
            reason,
        }
    }

    // ==================== Entry ====================

    /// Open a balanced pair worth `notional` quote units.
    pub async fn execute_entry(
        &self,
        symbol: &str,
        notional: Decimal,
    ) -> ExecResult<ExecutionOutcome> {
        if self.kill.is_engaged() || self.entries_halted() {
            return Err(ExecError::EntriesHalted);
        }

        let lock = self.symbol_lock(symbol).await;
        let _guard = lock.lock().await;

        let (spot_rules, perp_rules) = tokio::try_join!(
            self.gateway.fetch_instrument_rules(Venue::Spot, symbol),
            self.gateway.fetch_instrument_rules(Venue::Perp, symbol),
        )?;
        // The coarser of the two step sizes keeps both legs conforming.
        let step = spot_rules.step_size.max(perp_rules.step_size);

        let (spot_ticker, perp_ticker) = tokio::try_join!(
            self.gateway.fetch_ticker(Venue::Spot, symbol),
            self.gateway.fetch_ticker(Venue::Perp, symbol),
        )?;
        let reference = spot_ticker.mid();
        let perp_reference = perp_ticker.mid();

        let quantity = floor_to_step(safe_div(notional, reference), step);
        if quantity == Decimal::ZERO || quantity < spot_rules.min_qty.max(perp_rules.min_qty) {
            return Err(ExecError::InsufficientNotional {
                symbol: symbol.to_string(),
                notional,
            });
        }

        let base = self.base_asset(symbol);
        let spot_baseline = self.gateway.fetch_spot_balance(&base).await.ok();
        let perp_baseline = self
            .gateway
            .fetch_perp_position(symbol)
            .await
            .unwrap_or(Decimal::ZERO);

        info!(symbol, %quantity, %reference, "dispatching entry legs");

        // No ordering between the legs; each carries its own deadline and the
        // join runs to completion regardless of the kill switch.
        let (spot_leg, perp_leg) = tokio::join!(
            self.place_leg(Venue::Spot, symbol, OrderSide::Buy, quantity),
            self.place_leg(Venue::Perp, symbol, OrderSide::Sell, quantity),
        );

        let deadline = Instant::now() + self.timings.ambiguity_cap;

        match (spot_leg, perp_leg) {
            (LegOutcome::Filled(s), LegOutcome::Filled(p)) => {
                self.finish_balanced_entry(symbol, step, s, p).await
            }

            (LegOutcome::Filled(s), LegOutcome::Rejected(reason)) => {
                warn!(symbol, reason, "perpetual leg rejected, reversing spot fill");
                self.recover_leg(Venue::Spot, symbol, OrderSide::Sell, s.quantity, step)
                    .await?;
                telemetry::entry_aborted_leg_recovered(symbol, Leg::Spot.as_str());
                Ok(ExecutionOutcome::OneLegOrphaned {
                    leg: Leg::Spot,
                    recovered: true,
                })
            }

            (LegOutcome::Rejected(reason), LegOutcome::Filled(p)) => {
                warn!(symbol, reason, "spot leg rejected, covering perpetual short");
                self.recover_leg(Venue::Perp, symbol, OrderSide::Buy, p.quantity, step)
                    .await?;
                telemetry::entry_aborted_leg_recovered(symbol, Leg::Perp.as_str());
                Ok(ExecutionOutcome::OneLegOrphaned {
                    leg: Leg::Perp,
                    recovered: true,
                })
            }

            (LegOutcome::Rejected(_), LegOutcome::Rejected(_)) => {
                telemetry::entry_aborted_clean(symbol);
                Ok(ExecutionOutcome::BothFailed)
            }

            (LegOutcome::Filled(s), LegOutcome::Ambiguous(reason)) => {
                warn!(symbol, reason, "perpetual leg ambiguous, polling position");
                let filled = self
                    .resolve_leg(
                        symbol,
                        ProbeTarget::PerpPosition,
                        perp_baseline - quantity,
                        perp_baseline,
                        step,
                        deadline,
                    )
                    .await?;
                if filled {
                    let p =
                        self.synthesize_fill(symbol, OrderSide::Sell, quantity, perp_reference);
                    self.finish_balanced_entry(symbol, step, s, p).await
                } else {
                    self.recover_leg(Venue::Spot, symbol, OrderSide::Sell, s.quantity, step)
                        .await?;
                    telemetry::entry_aborted_leg_recovered(symbol, Leg::Spot.as_str());
                    Ok(ExecutionOutcome::OneLegOrphaned {
                        leg: Leg::Spot,
                        recovered: true,
                    })
                }
            }

            (LegOutcome::Ambiguous(reason), LegOutcome::Filled(p)) => {
                warn!(symbol, reason, "spot leg ambiguous, polling balance");
                let baseline = spot_baseline
                    .ok_or_else(|| self.manual(symbol, "no spot baseline to reconcile against"))?;
                let filled = self
                    .resolve_leg(
                        symbol,
                        ProbeTarget::SpotBalance(base.clone()),
                        baseline + quantity,
                        baseline,
                        step,
                        deadline,
                    )
                    .await?;
                if filled {
                    let s = self.synthesize_fill(symbol, OrderSide::Buy, quantity, reference);
                    self.finish_balanced_entry(symbol, step, s, p).await
                } else {
                    self.recover_leg(Venue::Perp, symbol, OrderSide::Buy, p.quantity, step)
                        .await?;
                    telemetry::entry_aborted_leg_recovered(symbol, Leg::Perp.as_str());
                    Ok(ExecutionOutcome::OneLegOrphaned {
                        leg: Leg::Perp,
                        recovered: true,
                    })
                }
            }

            (LegOutcome::Ambiguous(_), LegOutcome::Ambiguous(_)) => {
                warn!(symbol, "both legs ambiguous, polling both venues");
                let baseline = spot_baseline
                    .ok_or_else(|| self.manual(symbol, "no spot baseline to reconcile against"))?;
                let spot_filled = self
                    .resolve_leg(
                        symbol,
                        ProbeTarget::SpotBalance(base.clone()),
                        baseline + quantity,
                        baseline,
                        step,
                        deadline,
                    )
                    .await?;
                let perp_filled = self
                    .resolve_leg(
                        symbol,
                        ProbeTarget::PerpPosition,
                        perp_baseline - quantity,
                        perp_baseline,
                        step,
                        deadline,
                    )
                    .await?;

                match (spot_filled, perp_filled) {
                    (true, true) => {
                        let s =
                            self.synthesize_fill(symbol, OrderSide::Buy, quantity, reference);
                        let p = self.synthesize_fill(
                            symbol,
                            OrderSide::Sell,
                            quantity,
                            perp_reference,
                        );
                        self.finish_balanced_entry(symbol, step, s, p).await
                    }
                    (true, false) => {
                        self.recover_leg(Venue::Spot, symbol, OrderSide::Sell, quantity, step)
                            .await?;
                        telemetry::entry_aborted_leg_recovered(symbol, Leg::Spot.as_str());
                        Ok(ExecutionOutcome::OneLegOrphaned {
                            leg: Leg::Spot,
                            recovered: true,
                        })
                    }
                    (false, true) => {
                        self.recover_leg(Venue::Perp, symbol, OrderSide::Buy, quantity, step)
                            .await?;
                        telemetry::entry_aborted_leg_recovered(symbol, Leg::Perp.as_str());
                        Ok(ExecutionOutcome::OneLegOrphaned {
                            leg: Leg::Perp,
                            recovered: true,
                        })
                    }
                    (false, false) => {
                        telemetry::entry_aborted_clean(symbol);
                        Ok(ExecutionOutcome::BothFailed)
                    }
                }
            }
        }
    }

    /// Both legs filled: trim any excess beyond one step, record the pair.
    async fn finish_balanced_entry(
        &self,
        symbol: &str,
        step: Decimal,
        mut spot: Fill,
        mut perp: Fill,
    ) -> ExecResult<ExecutionOutcome> {
        let diff = spot.quantity - perp.quantity;
        if diff.abs() > step {
            let excess = floor_to_step(diff.abs(), step);
            if diff > Decimal::ZERO {
                warn!(symbol, %excess, "spot leg overfilled, closing excess");
                let fill = self
                    .recover_leg(Venue::Spot, symbol, OrderSide::Sell, excess, step)
                    .await?;
                spot.quantity -= excess;
                spot.fee += fill.fee;
            } else {
                warn!(symbol, %excess, "perpetual leg overfilled, covering excess");
                let fill = self
                    .recover_leg(Venue::Perp, symbol, OrderSide::Buy, excess, step)
                    .await?;
                perp.quantity -= excess;
                perp.fee += fill.fee;
            }
        }

        let common = spot.quantity.min(perp.quantity);
        if common <= Decimal::ZERO {
            // A zero-quantity "fill" means the leg never really traded.
            if spot.quantity > Decimal::ZERO {
                self.recover_leg(Venue::Spot, symbol, OrderSide::Sell, spot.quantity, step)
                    .await?;
            }
            if perp.quantity > Decimal::ZERO {
                self.recover_leg(Venue::Perp, symbol, OrderSide::Buy, perp.quantity, step)
                    .await?;
            }
            telemetry::entry_aborted_clean(symbol);
            return Ok(ExecutionOutcome::BothFailed);
        }

        let entry_spread = safe_div(perp.avg_price - spot.avg_price, spot.avg_price);
        let total_fees = spot.fee + perp.fee;
        let position = ActivePosition::open(symbol, common, common, entry_spread, total_fees)
            .map_err(|e| self.manual(symbol, format!("position record rejected: {}", e)))?;

        let entry_price = weighted_average(&[
            (spot.avg_price, common),
            (perp.avg_price, common),
        ]);
        telemetry::trade_entry(symbol, entry_price, common, common * spot.avg_price);
        info!(
            symbol,
            %common,
            %entry_spread,
            %total_fees,
            "entry complete, legs balanced"
        );
        Ok(ExecutionOutcome::BothFilled(position))
    }

    // ==================== Exit ====================

    /// Close the whole pair. Failed attempts restore leg balance and retry
    /// with backoff; exhaustion escalates to manual intervention.
    pub async fn execute_exit(&self, position: &ActivePosition) -> ExecResult<CloseSummary> {
        let lock = self.symbol_lock(&position.symbol).await;
        let _guard = lock.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .close_pair(&position.symbol, position.spot_qty, position.perp_qty)
                .await
            {
                Ok(Some(summary)) => {
                    let size = summary.spot_fill.quantity;
                    let price = weighted_average(&[
                        (summary.spot_fill.avg_price, size),
                        (summary.perp_fill.avg_price, size),
                    ]);
                    telemetry::trade_exit(
                        &position.symbol,
                        price,
                        size,
                        size * summary.spot_fill.avg_price,
                        ExitType::Full,
                    );
                    info!(symbol = %position.symbol, attempt, "exit complete");
                    return Ok(summary);
                }
                Ok(None) if attempt < self.timings.exit_attempts => {
                    let delay = self.timings.exit_backoff * 2u32.pow(attempt - 1);
                    warn!(
                        symbol = %position.symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "exit attempt failed, retrying"
                    );
                    sleep(delay).await;
                }
                Ok(None) => {
                    return Err(self.manual(
                        &position.symbol,
                        format!("exit failed after {} attempts", attempt),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Coordinated partial close of `quantity` on both legs, used by margin
    /// rebalancing. Single attempt; the guardian re-evaluates next tick.
    pub async fn execute_reduce(
        &self,
        position: &ActivePosition,
        quantity: Decimal,
    ) -> ExecResult<Option<CloseSummary>> {
        if self.kill.is_engaged() {
            return Err(ExecError::EntriesHalted);
        }
        let lock = self.symbol_lock(&position.symbol).await;
        let _guard = lock.lock().await;

        let result = self.close_pair(&position.symbol, quantity, quantity).await?;
        if let Some(summary) = &result {
            let size = summary.spot_fill.quantity;
            let price = weighted_average(&[
                (summary.spot_fill.avg_price, size),
                (summary.perp_fill.avg_price, size),
            ]);
            telemetry::trade_exit(
                &position.symbol,
                price,
                size,
                size * summary.spot_fill.avg_price,
                ExitType::Rebalance,
            );
        }
        Ok(result)
    }

    /// One close attempt: sell spot, buy back perpetual, same joint-outcome
    /// discipline as entry. `Ok(None)` means the attempt did not complete but
    /// leg balance was restored.
    async fn close_pair(
        &self,
        symbol: &str,
        spot_qty: Decimal,
        perp_qty: Decimal,
    ) -> ExecResult<Option<CloseSummary>> {
        let (spot_rules, perp_rules) = tokio::try_join!(
            self.gateway.fetch_instrument_rules(Venue::Spot, symbol),
            self.gateway.fetch_instrument_rules(Venue::Perp, symbol),
        )?;
        let step = spot_rules.step_size.max(perp_rules.step_size);

        let base = self.base_asset(symbol);
        let spot_baseline = self.gateway.fetch_spot_balance(&base).await.ok();
        let perp_baseline = self
            .gateway
            .fetch_perp_position(symbol)
            .await
            .unwrap_or(-perp_qty);

        let (spot_leg, perp_leg) = tokio::join!(
            self.place_leg(Venue::Spot, symbol, OrderSide::Sell, spot_qty),
            self.place_leg(Venue::Perp, symbol, OrderSide::Buy, perp_qty),
        );

        let deadline = Instant::now() + self.timings.ambiguity_cap;

        // Resolve each leg to filled/unfilled, then either finish or restore.
        let spot_filled = match spot_leg {
            LegOutcome::Filled(fill) => Some(fill),
            LegOutcome::Rejected(reason) => {
                debug!(symbol, reason, "spot close leg rejected");
                None
            }
            LegOutcome::Ambiguous(reason) => {
                warn!(symbol, reason, "spot close leg ambiguous, polling balance");
                let baseline = spot_baseline
                    .ok_or_else(|| self.manual(symbol, "no spot baseline to reconcile against"))?;
                if self
                    .resolve_leg(
                        symbol,
                        ProbeTarget::SpotBalance(base.clone()),
                        baseline - spot_qty,
                        baseline,
                        step,
                        deadline,
                    )
                    .await?
                {
                    Some(self.synthesize_fill_at_market(symbol, Venue::Spot, OrderSide::Sell, spot_qty).await)
                } else {
                    None
                }
            }
        };

        let perp_filled = match perp_leg {
            LegOutcome::Filled(fill) => Some(fill),
            LegOutcome::Rejected(reason) => {
                debug!(symbol, reason, "perpetual close leg rejected");
                None
            }
            LegOutcome::Ambiguous(reason) => {
                warn!(symbol, reason, "perpetual close leg ambiguous, polling position");
                if self
                    .resolve_leg(
                        symbol,
                        ProbeTarget::PerpPosition,
                        perp_baseline + perp_qty,
                        perp_baseline,
                        step,
                        deadline,
                    )
                    .await?
                {
                    Some(self.synthesize_fill_at_market(symbol, Venue::Perp, OrderSide::Buy, perp_qty).await)
                } else {
                    None
                }
            }
        };

        match (spot_filled, perp_filled) {
            (Some(spot_fill), Some(perp_fill)) => Ok(Some(CloseSummary {
                spot_fill,
                perp_fill,
            })),
            (Some(spot_fill), None) => {
                // Spot sold but the short remains: buy the spot back so the
                // pair stays balanced for the retry.
                warn!(symbol, "perpetual close failed, restoring spot leg");
                self.recover_leg(Venue::Spot, symbol, OrderSide::Buy, spot_fill.quantity, step)
                    .await?;
                Ok(None)
            }
            (None, Some(perp_fill)) => {
                warn!(symbol, "spot close failed, restoring perpetual short");
                self.recover_leg(Venue::Perp, symbol, OrderSide::Sell, perp_fill.quantity, step)
                    .await?;
                Ok(None)
            }
            (None, None) => Ok(None),
        }
    }

    // ==================== Leg mechanics ====================

    async fn place_leg(
        &self,
        venue: Venue,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> LegOutcome {
        match timeout(
            self.timings.leg_timeout,
            self.gateway.place_market_order(venue, symbol, side, quantity),
        )
        .await
        {
            Ok(Ok(fill)) => LegOutcome::Filled(fill),
            Ok(Err(e)) if e.proves_not_placed() => LegOutcome::Rejected(e.to_string()),
            // An auth rejection is still a response: nothing was placed.
            Ok(Err(GatewayError::Auth(m))) => LegOutcome::Rejected(m),
            Ok(Err(e)) => LegOutcome::Ambiguous(e.to_string()),
            Err(_) => LegOutcome::Ambiguous(format!(
                "no outcome within {:?}",
                self.timings.leg_timeout
            )),
        }
    }

    /// Reverse (part of) a filled leg at market. Failure here leaves a naked
    /// position, which is exactly what manual intervention is for.
    async fn recover_leg(
        &self,
        venue: Venue,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        step: Decimal,
    ) -> ExecResult<Fill> {
        let quantity = floor_to_step(quantity, step);
        if quantity <= Decimal::ZERO {
            return Ok(self.synthesize_fill(symbol, side, Decimal::ZERO, Decimal::ZERO));
        }
        match timeout(
            self.timings.leg_timeout,
            self.gateway.place_market_order(venue, symbol, side, quantity),
        )
        .await
        {
            Ok(Ok(fill)) => {
                info!(symbol, %venue, %quantity, "leg recovered at market");
                Ok(fill)
            }
            Ok(Err(e)) => Err(self.manual(
                symbol,
                format!("{} recovery order failed: {}", venue, e),
            )),
            Err(_) => Err(self.manual(
                symbol,
                format!("{} recovery order timed out", venue),
            )),
        }
    }

    /// Poll one venue-side observation until it matches the filled or
    /// unfilled level. A diverged observation (partial fill) is corrected
    /// back to the unfilled baseline and reported as unfilled. Running past
    /// the hard deadline without a conclusive read raises manual
    /// intervention.
    async fn resolve_leg(
        &self,
        symbol: &str,
        target: ProbeTarget,
        filled_at: Decimal,
        unfilled_at: Decimal,
        step: Decimal,
        hard_deadline: Instant,
    ) -> ExecResult<bool> {
        let verdict = self
            .probe(symbol, &target, filled_at, unfilled_at, step, hard_deadline)
            .await?;

        match verdict {
            ProbeVerdict::Filled => Ok(true),
            ProbeVerdict::Unfilled => Ok(false),
            ProbeVerdict::Diverged(observed) => {
                let delta = observed - unfilled_at;
                let side = if delta > Decimal::ZERO {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                };
                let venue = match target {
                    ProbeTarget::PerpPosition => Venue::Perp,
                    ProbeTarget::SpotBalance(_) => Venue::Spot,
                };
                warn!(symbol, %observed, %unfilled_at, "leg diverged, correcting to baseline");
                self.recover_leg(venue, symbol, side, delta.abs(), step).await?;
                Ok(false)
            }
        }
    }

    async fn probe(
        &self,
        symbol: &str,
        target: &ProbeTarget,
        filled_at: Decimal,
        unfilled_at: Decimal,
        step: Decimal,
        hard_deadline: Instant,
    ) -> ExecResult<ProbeVerdict> {
        let poll_deadline = Instant::now() + self.timings.poll_budget;
        let mut last_observation: Option<Decimal> = None;

        loop {
            let observation = match target {
                ProbeTarget::PerpPosition => self.gateway.fetch_perp_position(symbol).await,
                ProbeTarget::SpotBalance(asset) => self.gateway.fetch_spot_balance(asset).await,
            };

            match observation {
                Ok(value) => {
                    last_observation = Some(value);
                    if (value - filled_at).abs() <= step {
                        return Ok(ProbeVerdict::Filled);
                    }
                }
                Err(e) => debug!(symbol, error = %e, "reconciliation poll failed"),
            }

            let now = Instant::now();
            if now >= poll_deadline {
                match last_observation {
                    Some(value) if (value - unfilled_at).abs() <= step => {
                        return Ok(ProbeVerdict::Unfilled);
                    }
                    Some(value) => return Ok(ProbeVerdict::Diverged(value)),
                    None if now >= hard_deadline => {
                        return Err(self.manual(
                            symbol,
                            "leg outcome unresolvable within the reconciliation window",
                        ));
                    }
                    // No successful read yet; keep polling up to the hard cap.
                    None => {}
                }
            }
            if now >= hard_deadline {
                return Err(self.manual(
                    symbol,
                    "leg outcome unresolvable within the reconciliation window",
                ));
            }
            sleep(self.timings.poll_interval).await;
        }
    }

    fn synthesize_fill(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Fill {
        Fill {
            symbol: symbol.to_string(),
            side,
            quantity,
            avg_price: price,
            fee: quantity * price * ESTIMATED_TAKER_FEE,
        }
    }

    /// Synthesize a fill for a leg confirmed only through polling, priced at
    /// the current ticker mid.
    async fn synthesize_fill_at_market(
        &self,
        symbol: &str,
        venue: Venue,
        side: OrderSide,
        quantity: Decimal,
    ) -> Fill {
        let price = self
            .gateway
            .fetch_ticker(venue, symbol)
            .await
            .map(|t| t.mid())
            .unwrap_or(Decimal::ZERO);
        self.synthesize_fill(symbol, side, quantity, price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::OrderBehavior;
    use crate::exchange::MockGateway;

    fn test_timings() -> ExecTimings {
        ExecTimings {
            leg_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            poll_budget: Duration::from_millis(50),
            ambiguity_cap: Duration::from_millis(500),
            exit_backoff: Duration::from_millis(10),
            exit_attempts: 3,
        }
    }

    async fn doge_gateway() -> MockGateway {
        let gateway = MockGateway::new();
        gateway
            .list_pair("DOGEUSDT", "DOGE", "USDT", dec!(0.10), dec!(0.1003))
            .await;
        gateway
    }

    fn manager(gateway: &MockGateway) -> OrderManager {
        OrderManager::with_timings(
            Arc::new(gateway.clone()),
            "USDT",
            KillSwitch::new(),
            test_timings(),
        )
    }

    async fn entered_position(gateway: &MockGateway, orders: &OrderManager) -> ActivePosition {
        match orders.execute_entry("DOGEUSDT", dec!(1000)).await.unwrap() {
            ExecutionOutcome::BothFilled(position) => {
                assert_eq!(gateway.perp_position("DOGEUSDT").await, -position.perp_qty);
                position
            }
            other => panic!("expected both legs filled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn happy_entry_records_balanced_position() {
        let gateway = doge_gateway().await;
        let orders = manager(&gateway);

        let position = entered_position(&gateway, &orders).await;

        assert_eq!(position.spot_qty, dec!(10000));
        assert_eq!(position.perp_qty, dec!(10000));
        assert_eq!(position.entry_spread, dec!(0.003));
        assert!(position.total_fees > Decimal::ZERO);
        assert_eq!(gateway.spot_balance("DOGE").await, dec!(10000));
    }

    #[tokio::test]
    async fn perp_rejection_reverses_the_spot_fill() {
        let gateway = doge_gateway().await;
        gateway
            .push_order_behavior(
                Venue::Perp,
                "DOGEUSDT",
                OrderBehavior::RejectPrePlace("bad notional".into()),
            )
            .await;
        let orders = manager(&gateway);

        let outcome = orders.execute_entry("DOGEUSDT", dec!(1000)).await.unwrap();
        match outcome {
            ExecutionOutcome::OneLegOrphaned { leg, recovered } => {
                assert_eq!(leg, Leg::Spot);
                assert!(recovered);
            }
            other => panic!("expected orphaned spot leg, got {:?}", other),
        }

        assert_eq!(gateway.spot_balance("DOGE").await, Decimal::ZERO);
        assert_eq!(gateway.perp_position("DOGEUSDT").await, Decimal::ZERO);
        // buy then recovery sell, both on spot
        let placed = gateway.placed_orders().await;
        assert_eq!(placed.len(), 2);
        assert!(placed.iter().all(|o| o.venue == Venue::Spot));
    }

    #[tokio::test]
    async fn spot_rejection_covers_the_perp_short() {
        let gateway = doge_gateway().await;
        gateway
            .push_order_behavior(
                Venue::Spot,
                "DOGEUSDT",
                OrderBehavior::RejectPrePlace("insufficient balance".into()),
            )
            .await;
        let orders = manager(&gateway);

        let outcome = orders.execute_entry("DOGEUSDT", dec!(1000)).await.unwrap();
        match outcome {
            ExecutionOutcome::OneLegOrphaned { leg, recovered } => {
                assert_eq!(leg, Leg::Perp);
                assert!(recovered);
            }
            other => panic!("expected orphaned perp leg, got {:?}", other),
        }
        assert_eq!(gateway.perp_position("DOGEUSDT").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn double_rejection_leaves_nothing_behind() {
        let gateway = doge_gateway().await;
        for venue in [Venue::Spot, Venue::Perp] {
            gateway
                .push_order_behavior(
                    venue,
                    "DOGEUSDT",
                    OrderBehavior::RejectPrePlace("halted".into()),
                )
                .await;
        }
        let orders = manager(&gateway);

        let outcome = orders.execute_entry("DOGEUSDT", dec!(1000)).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::BothFailed));
        assert!(gateway.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn notional_flooring_to_zero_is_rejected() {
        let gateway = doge_gateway().await;
        let orders = manager(&gateway);

        // 0.05 / 0.10 = 0.5, floored to step 1 -> 0
        let err = orders.execute_entry("DOGEUSDT", dec!(0.05)).await.unwrap_err();
        assert!(matches!(err, ExecError::InsufficientNotional { .. }));
        assert!(gateway.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn ambiguous_perp_leg_confirmed_by_polling() {
        let gateway = doge_gateway().await;
        gateway
            .push_order_behavior(
                Venue::Perp,
                "DOGEUSDT",
                OrderBehavior::Ambiguous { applied: true },
            )
            .await;
        let orders = manager(&gateway);

        let position = entered_position(&gateway, &orders).await;
        assert_eq!(position.perp_qty, dec!(10000));
        // Synthesized from the pre-dispatch perp mark.
        assert_eq!(position.entry_spread, dec!(0.003));
    }

    #[tokio::test]
    async fn ambiguous_perp_leg_unfilled_recovers_spot() {
        let gateway = doge_gateway().await;
        gateway
            .push_order_behavior(
                Venue::Perp,
                "DOGEUSDT",
                OrderBehavior::Ambiguous { applied: false },
            )
            .await;
        let orders = manager(&gateway);

        let outcome = orders.execute_entry("DOGEUSDT", dec!(1000)).await.unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::OneLegOrphaned {
                leg: Leg::Spot,
                recovered: true
            }
        ));
        assert_eq!(gateway.spot_balance("DOGE").await, Decimal::ZERO);
        assert_eq!(gateway.perp_position("DOGEUSDT").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn partial_perp_fill_trims_the_spot_excess() {
        let gateway = doge_gateway().await;
        gateway
            .push_order_behavior(Venue::Perp, "DOGEUSDT", OrderBehavior::PartialFill(dec!(0.6)))
            .await;
        let orders = manager(&gateway);

        let position = entered_position(&gateway, &orders).await;
        assert_eq!(position.spot_qty, dec!(6000));
        assert_eq!(position.perp_qty, dec!(6000));
        assert_eq!(gateway.spot_balance("DOGE").await, dec!(6000));
        assert_eq!(gateway.perp_position("DOGEUSDT").await, dec!(-6000));
    }

    #[tokio::test]
    async fn exit_reverses_entry_with_positive_fees() {
        let gateway = doge_gateway().await;
        let orders = manager(&gateway);
        let position = entered_position(&gateway, &orders).await;

        let summary = orders.execute_exit(&position).await.unwrap();

        assert!(summary.fees() > Decimal::ZERO);
        assert_eq!(gateway.spot_balance("DOGE").await, Decimal::ZERO);
        assert_eq!(gateway.perp_position("DOGEUSDT").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn failed_exit_leg_is_restored_then_retried() {
        let gateway = doge_gateway().await;
        let orders = manager(&gateway);
        let position = entered_position(&gateway, &orders).await;

        gateway
            .push_order_behavior(
                Venue::Perp,
                "DOGEUSDT",
                OrderBehavior::RejectPrePlace("transient refusal".into()),
            )
            .await;

        orders.execute_exit(&position).await.unwrap();

        // First attempt sold and re-bought spot, second attempt closed both.
        assert_eq!(gateway.spot_balance("DOGE").await, Decimal::ZERO);
        assert_eq!(gateway.perp_position("DOGEUSDT").await, Decimal::ZERO);
        let placed = gateway.placed_orders().await;
        assert_eq!(placed.len(), 6);
    }

    #[tokio::test]
    async fn exhausted_exit_attempts_escalate_and_halt_entries() {
        let gateway = doge_gateway().await;
        let orders = manager(&gateway);
        let position = entered_position(&gateway, &orders).await;

        for _ in 0..3 {
            gateway
                .push_order_behavior(
                    Venue::Perp,
                    "DOGEUSDT",
                    OrderBehavior::RejectPrePlace("persistent refusal".into()),
                )
                .await;
        }

        let err = orders.execute_exit(&position).await.unwrap_err();
        assert!(matches!(err, ExecError::ManualIntervention { .. }));
        assert!(orders.entries_halted());

        // The pair is still balanced despite the failed close.
        assert_eq!(gateway.spot_balance("DOGE").await, dec!(10000));
        assert_eq!(gateway.perp_position("DOGEUSDT").await, dec!(-10000));

        let err = orders.execute_entry("DOGEUSDT", dec!(1000)).await.unwrap_err();
        assert!(matches!(err, ExecError::EntriesHalted));
    }

    #[tokio::test]
    async fn engaged_kill_switch_rejects_entries_but_not_exits() {
        let gateway = doge_gateway().await;
        let kill = KillSwitch::new();
        let orders = OrderManager::with_timings(
            Arc::new(gateway.clone()),
            "USDT",
            kill.clone(),
            test_timings(),
        );
        let position = entered_position(&gateway, &orders).await;

        kill.engage("test drain");

        let err = orders.execute_entry("DOGEUSDT", dec!(1000)).await.unwrap_err();
        assert!(matches!(err, ExecError::EntriesHalted));

        // Exits keep working so the drain can complete.
        orders.execute_exit(&position).await.unwrap();
        assert_eq!(gateway.perp_position("DOGEUSDT").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn reduce_shrinks_both_legs_together() {
        let gateway = doge_gateway().await;
        let orders = manager(&gateway);
        let position = entered_position(&gateway, &orders).await;

        let summary = orders
            .execute_reduce(&position, dec!(4000))
            .await
            .unwrap()
            .expect("reduce should fill");

        assert_eq!(summary.spot_fill.quantity, dec!(4000));
        assert_eq!(gateway.spot_balance("DOGE").await, dec!(6000));
        assert_eq!(gateway.perp_position("DOGEUSDT").await, dec!(-6000));
    }
}
