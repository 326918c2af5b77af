//! Per-position monitoring loop.
//!
//! One guardian per open position, ticking every `guardian_period_s`. Exit
//! triggers are evaluated before rebalancing within a tick; a closed
//! position needs no rebalance. Registry mutations are requested through
//! the supervisor's command channel, never applied directly.

use crate::config::{Config, ExitConfig, MarginConfig};
use crate::error::{ExecError, GatewayResult};
use crate::exchange::{AccountState, ExchangeGateway, Venue, Wallet};
use crate::position::{ActivePosition, PositionStatus};
use crate::risk::margin;
use crate::shutdown::KillSwitch;
use crate::strategy::OrderManager;
use crate::supervisor::RegistryCommand;
use crate::telemetry;
use crate::utils::decimal::{floor_to_step, safe_div};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub exit: ExitConfig,
    pub margin: MarginConfig,
    pub quote_currency: String,
    pub period: Duration,
    /// Budget for the sampling phase of one tick; overruns log and proceed.
    pub tick_budget: Duration,
}

impl GuardianConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exit: config.exit.clone(),
            margin: config.margin.clone(),
            quote_currency: config.entry.quote_currency.clone(),
            period: Duration::from_secs(config.timing.guardian_period_s),
            tick_budget: Duration::from_secs(8),
        }
    }
}

/// Why the guardian requested an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitTrigger {
    NegativeFunding,
    Backwardation,
    /// Kill-switch drain.
    Drain,
    /// Position found in CLOSING; finish what was started.
    Resume,
}

impl ExitTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            ExitTrigger::NegativeFunding => "negative_funding",
            ExitTrigger::Backwardation => "backwardation",
            ExitTrigger::Drain => "drain",
            ExitTrigger::Resume => "resume",
        }
    }
}

struct GuardianSample {
    funding_rate: Decimal,
    spread: Decimal,
    account: AccountState,
}

enum TickOutcome {
    Continue,
    Terminated,
}

pub struct PositionGuardian {
    position: ActivePosition,
    gateway: Arc<dyn ExchangeGateway>,
    orders: Arc<OrderManager>,
    config: GuardianConfig,
    registry: mpsc::Sender<RegistryCommand>,
    kill: KillSwitch,
    consecutive_negative_fr: u32,
}

impl PositionGuardian {
    pub fn new(
        position: ActivePosition,
        gateway: Arc<dyn ExchangeGateway>,
        orders: Arc<OrderManager>,
        config: GuardianConfig,
        registry: mpsc::Sender<RegistryCommand>,
        kill: KillSwitch,
    ) -> Self {
        Self {
            position,
            gateway,
            orders,
            config,
            registry,
            kill,
            consecutive_negative_fr: 0,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut kill_rx = self.kill.subscribe();

        info!(symbol = %self.position.symbol, "guardian started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.kill.is_engaged() {
                        self.drain_exit().await;
                        return;
                    }
                    if let TickOutcome::Terminated = self.tick().await {
                        return;
                    }
                }
                _ = kill_rx.changed() => {
                    self.drain_exit().await;
                    return;
                }
            }
        }
    }

    /// One monitoring pass. Exposed to tests.
    async fn tick(&mut self) -> TickOutcome {
        // A position stuck in CLOSING needs its exit finished, not samples.
        if self.position.status == PositionStatus::Closing {
            return self.attempt_exit(ExitTrigger::Resume).await;
        }

        let sample = match timeout(self.config.tick_budget, self.sample()).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                warn!(symbol = %self.position.symbol, error = %e, "tick sampling failed");
                return TickOutcome::Continue;
            }
            Err(_) => {
                warn!(
                    symbol = %self.position.symbol,
                    budget_s = self.config.tick_budget.as_secs(),
                    "tick sampling exceeded budget"
                );
                return TickOutcome::Continue;
            }
        };

        if let Some(trigger) = self.evaluate_exit(&sample) {
            return self.attempt_exit(trigger).await;
        }

        if sample.account.margin_usage() >= self.config.margin.usage_high {
            return self.rebalance().await;
        }

        TickOutcome::Continue
    }

    async fn sample(&self) -> GatewayResult<GuardianSample> {
        let symbol = self.position.symbol.as_str();
        let (funding, spot, perp, account) = tokio::try_join!(
            self.gateway.fetch_funding_rate(symbol),
            self.gateway.fetch_ticker(Venue::Spot, symbol),
            self.gateway.fetch_ticker(Venue::Perp, symbol),
            self.gateway.fetch_account(),
        )?;

        let spot_mid = spot.mid();
        Ok(GuardianSample {
            funding_rate: funding.predicted_rate,
            spread: safe_div(perp.mid() - spot_mid, spot_mid),
            account,
        })
    }

    /// First matching trigger wins. The funding-rate exit is debounced over
    /// consecutive samples; backwardation fires on a single sample because
    /// the opportunity may be transient.
    fn evaluate_exit(&mut self, sample: &GuardianSample) -> Option<ExitTrigger> {
        if sample.funding_rate <= self.config.exit.exit_funding_rate {
            self.consecutive_negative_fr += 1;
        } else {
            self.consecutive_negative_fr = 0;
        }

        if self.consecutive_negative_fr >= self.config.exit.negative_fr_debounce {
            telemetry::guardian_negative_fr(&self.position.symbol, self.consecutive_negative_fr);
            return Some(ExitTrigger::NegativeFunding);
        }

        if sample.spread <= self.config.exit.exit_spread {
            telemetry::guardian_backwardation(&self.position.symbol, sample.spread);
            return Some(ExitTrigger::Backwardation);
        }

        None
    }

    async fn attempt_exit(&mut self, trigger: ExitTrigger) -> TickOutcome {
        let symbol = self.position.symbol.clone();
        info!(%symbol, trigger = trigger.as_str(), "requesting position exit");

        if self.position.transition(PositionStatus::Closing).is_ok() {
            self.send(RegistryCommand::Transition {
                id: self.position.id.clone(),
                to: PositionStatus::Closing,
            })
            .await;
        }

        match self.orders.execute_exit(&self.position).await {
            Ok(summary) => {
                self.send(RegistryCommand::Closed {
                    id: self.position.id.clone(),
                    close_fees: summary.fees(),
                })
                .await;
                info!(%symbol, "position closed, guardian terminating");
                TickOutcome::Terminated
            }
            Err(ExecError::ManualIntervention { reason, .. }) => {
                self.send(RegistryCommand::ManualIntervention {
                    symbol: symbol.clone(),
                    reason,
                })
                .await;
                TickOutcome::Terminated
            }
            Err(e) => {
                // Stays CLOSING; the next tick resumes the exit.
                error!(%symbol, error = %e, "exit attempt failed");
                TickOutcome::Continue
            }
        }
    }

    /// Keep trying to close out during a drain until the exit either
    /// completes or escalates; the supervisor's drain deadline bounds this.
    async fn drain_exit(&mut self) {
        loop {
            match self.attempt_exit(ExitTrigger::Drain).await {
                TickOutcome::Terminated => return,
                TickOutcome::Continue => tokio::time::sleep(self.config.period).await,
            }
        }
    }

    /// Margin usage crossed the high band: top up from the spot wallet if it
    /// has free quote, otherwise shrink both legs. Skipped, not retried, if
    /// margin recovered before the operation begins.
    async fn rebalance(&mut self) -> TickOutcome {
        let symbol = self.position.symbol.clone();

        let account = match self.gateway.fetch_account().await {
            Ok(account) => account,
            Err(e) => {
                warn!(%symbol, error = %e, "rebalance aborted, account unreadable");
                return TickOutcome::Continue;
            }
        };
        let usage = account.margin_usage();
        if usage < self.config.margin.usage_high {
            debug!(%symbol, %usage, "margin recovered before rebalance, skipping");
            return TickOutcome::Continue;
        }

        let free_quote = self
            .gateway
            .fetch_spot_balance(&self.config.quote_currency)
            .await
            .unwrap_or(Decimal::ZERO);

        if free_quote > Decimal::ZERO {
            let needed = margin::top_up_needed(&account, self.config.margin.usage_target);
            let amount = needed.min(free_quote);
            if amount > Decimal::ZERO {
                match self
                    .gateway
                    .transfer(Wallet::Spot, Wallet::Perp, &self.config.quote_currency, amount)
                    .await
                {
                    Ok(()) => {
                        info!(%symbol, %amount, %usage, "margin topped up from spot wallet");
                    }
                    Err(e) => warn!(%symbol, error = %e, "margin transfer failed"),
                }
            }
            return TickOutcome::Continue;
        }

        // No free quote anywhere: shrink the pair to release margin.
        let ratio = margin::shrink_ratio(&account, self.config.margin.usage_target);
        let step = match tokio::try_join!(
            self.gateway.fetch_instrument_rules(Venue::Spot, &symbol),
            self.gateway.fetch_instrument_rules(Venue::Perp, &symbol),
        ) {
            Ok((s, p)) => s.step_size.max(p.step_size),
            Err(e) => {
                warn!(%symbol, error = %e, "rebalance aborted, rules unreadable");
                return TickOutcome::Continue;
            }
        };

        let mut quantity = floor_to_step(ratio * self.position.spot_qty, step);
        // Never shrink to nothing; a full close is the exit path's job.
        if quantity >= self.position.spot_qty {
            quantity = self.position.spot_qty - step;
        }
        if quantity <= Decimal::ZERO {
            debug!(%symbol, %ratio, "shrink quantity below one step, skipping");
            return TickOutcome::Continue;
        }

        let reduced = self.orders.execute_reduce(&self.position, quantity).await;
        match reduced {
            Ok(Some(summary)) => {
                let new_spot = self.position.spot_qty - summary.spot_fill.quantity;
                let new_perp = self.position.perp_qty - summary.perp_fill.quantity;
                if let Err(e) = self.position.reduce(new_spot, new_perp, summary.fees()) {
                    error!(%symbol, error = %e, "reduced quantities rejected");
                    return TickOutcome::Continue;
                }
                self.send(RegistryCommand::QuantitiesChanged {
                    id: self.position.id.clone(),
                    spot_qty: self.position.spot_qty,
                    perp_qty: self.position.perp_qty,
                    total_fees: self.position.total_fees,
                })
                .await;
                info!(%symbol, %quantity, "pair shrunk to release margin");
                TickOutcome::Continue
            }
            Ok(None) => {
                warn!(%symbol, "shrink attempt did not complete, will re-evaluate");
                TickOutcome::Continue
            }
            Err(ExecError::ManualIntervention { reason, .. }) => {
                self.send(RegistryCommand::ManualIntervention { symbol, reason })
                    .await;
                TickOutcome::Terminated
            }
            Err(e) => {
                warn!(%symbol, error = %e, "shrink attempt failed");
                TickOutcome::Continue
            }
        }
    }

    async fn send(&self, command: RegistryCommand) {
        if self.registry.send(command).await.is_err() {
            warn!(symbol = %self.position.symbol, "registry channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockGateway;
    use crate::strategy::ExecTimings;
    use rust_decimal_macros::dec;

    fn test_config() -> GuardianConfig {
        GuardianConfig {
            exit: ExitConfig::default(),
            margin: MarginConfig::default(),
            quote_currency: "USDT".to_string(),
            period: Duration::from_millis(10),
            tick_budget: Duration::from_secs(2),
        }
    }

    fn calm_account() -> AccountState {
        AccountState {
            withdrawable: dec!(600),
            margin_in_use: dec!(200),
            account_equity: dec!(1000),
        }
    }

    fn stretched_account() -> AccountState {
        AccountState {
            withdrawable: dec!(10),
            margin_in_use: dec!(900),
            account_equity: dec!(1000),
        }
    }

    async fn open_pair_gateway() -> MockGateway {
        let gateway = MockGateway::new();
        gateway
            .list_pair("DOGEUSDT", "DOGE", "USDT", dec!(0.10), dec!(0.1003))
            .await;
        gateway.set_spot_balance("DOGE", dec!(10000)).await;
        gateway.set_perp_position("DOGEUSDT", dec!(-10000)).await;
        gateway.set_account(calm_account()).await;
        gateway.set_funding("DOGEUSDT", dec!(0.0004)).await;
        gateway
    }

    fn guardian(
        gateway: &MockGateway,
        config: GuardianConfig,
    ) -> (PositionGuardian, mpsc::Receiver<RegistryCommand>) {
        let (tx, rx) = mpsc::channel(32);
        let gateway_arc: Arc<dyn ExchangeGateway> = Arc::new(gateway.clone());
        let orders = Arc::new(OrderManager::with_timings(
            gateway_arc.clone(),
            "USDT",
            KillSwitch::new(),
            ExecTimings {
                leg_timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(10),
                poll_budget: Duration::from_millis(50),
                ambiguity_cap: Duration::from_millis(500),
                exit_backoff: Duration::from_millis(10),
                exit_attempts: 3,
            },
        ));
        let position =
            ActivePosition::open("DOGEUSDT", dec!(10000), dec!(10000), dec!(0.003), dec!(0.8))
                .unwrap();
        (
            PositionGuardian::new(
                position,
                gateway_arc,
                orders,
                config,
                tx,
                KillSwitch::new(),
            ),
            rx,
        )
    }

    #[tokio::test]
    async fn negative_funding_exit_respects_the_debounce() {
        let gateway = open_pair_gateway().await;
        // Spec sequence: reset at index 3, third qualifier lands at index 6.
        gateway
            .push_funding_sequence(
                "DOGEUSDT",
                &[
                    dec!(0.0001),
                    dec!(0.0000),
                    dec!(-0.0001),
                    dec!(0.0002),
                    dec!(0.0000),
                    dec!(0.0000),
                    dec!(0.0000),
                ],
            )
            .await;
        let (mut guardian, mut rx) = guardian(&gateway, test_config());

        for i in 0..6 {
            assert!(
                matches!(guardian.tick().await, TickOutcome::Continue),
                "exited early at sample {}",
                i
            );
        }
        assert!(matches!(guardian.tick().await, TickOutcome::Terminated));

        assert!(matches!(
            rx.recv().await,
            Some(RegistryCommand::Transition {
                to: PositionStatus::Closing,
                ..
            })
        ));
        assert!(matches!(rx.recv().await, Some(RegistryCommand::Closed { .. })));
        assert_eq!(gateway.perp_position("DOGEUSDT").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn funding_exactly_at_threshold_counts_toward_debounce() {
        let gateway = open_pair_gateway().await;
        gateway
            .push_funding_sequence(
                "DOGEUSDT",
                &[dec!(0.00005), dec!(0.00005), dec!(0.00005)],
            )
            .await;
        let (mut guardian, _rx) = guardian(&gateway, test_config());

        assert!(matches!(guardian.tick().await, TickOutcome::Continue));
        assert!(matches!(guardian.tick().await, TickOutcome::Continue));
        assert!(matches!(guardian.tick().await, TickOutcome::Terminated));
    }

    #[tokio::test]
    async fn backwardation_exits_on_a_single_sample() {
        let gateway = open_pair_gateway().await;
        // Spread -1.2%, one sample, no debounce.
        gateway.set_prices("DOGEUSDT", dec!(0.10), dec!(0.0988)).await;
        let (mut guardian, mut rx) = guardian(&gateway, test_config());

        assert!(matches!(guardian.tick().await, TickOutcome::Terminated));
        assert!(matches!(
            rx.recv().await,
            Some(RegistryCommand::Transition { .. })
        ));
    }

    #[tokio::test]
    async fn spread_exactly_at_exit_threshold_fires() {
        let gateway = open_pair_gateway().await;
        // (0.099 - 0.10) / 0.10 = -0.01 exactly.
        gateway.set_prices("DOGEUSDT", dec!(0.10), dec!(0.099)).await;
        let (mut guardian, _rx) = guardian(&gateway, test_config());

        assert!(matches!(guardian.tick().await, TickOutcome::Terminated));
    }

    #[tokio::test]
    async fn high_margin_with_free_quote_transfers_instead_of_shrinking() {
        let gateway = open_pair_gateway().await;
        gateway.set_account(stretched_account()).await;
        gateway.set_spot_balance("USDT", dec!(500)).await;
        let (mut guardian, _rx) = guardian(&gateway, test_config());

        assert!(matches!(guardian.tick().await, TickOutcome::Continue));

        let transfers = gateway.transfers().await;
        assert_eq!(transfers.len(), 1);
        // needed = 900/0.5 - 1000 = 800, capped by the 500 available.
        assert_eq!(transfers[0].amount, dec!(500));
        assert_eq!(transfers[0].asset, "USDT");
        assert!(gateway.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn high_margin_without_quote_shrinks_both_legs() {
        let gateway = open_pair_gateway().await;
        gateway.set_account(stretched_account()).await;
        let (mut guardian, mut rx) = guardian(&gateway, test_config());

        assert!(matches!(guardian.tick().await, TickOutcome::Continue));

        // r = 1 - 0.5 * 1000/900 = 4/9 -> 4444 after flooring to step 1.
        assert_eq!(gateway.perp_position("DOGEUSDT").await, dec!(-5556));
        assert_eq!(gateway.spot_balance("DOGE").await, dec!(5556));
        match rx.recv().await {
            Some(RegistryCommand::QuantitiesChanged {
                spot_qty, perp_qty, ..
            }) => {
                assert_eq!(spot_qty, dec!(5556));
                assert_eq!(perp_qty, dec!(5556));
            }
            other => panic!("expected quantity update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rebalance_is_skipped_when_margin_recovers_first() {
        let gateway = open_pair_gateway().await;
        // Tick sample sees high usage; the pre-rebalance re-check sees calm.
        gateway
            .push_account_sequence(&[stretched_account(), calm_account()])
            .await;
        gateway.set_spot_balance("USDT", dec!(500)).await;
        let (mut guardian, _rx) = guardian(&gateway, test_config());

        assert!(matches!(guardian.tick().await, TickOutcome::Continue));
        assert!(gateway.transfers().await.is_empty());
        assert!(gateway.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn exit_trigger_wins_over_rebalance_in_the_same_tick() {
        let gateway = open_pair_gateway().await;
        gateway.set_account(stretched_account()).await;
        gateway.set_prices("DOGEUSDT", dec!(0.10), dec!(0.0988)).await;
        let (mut guardian, _rx) = guardian(&gateway, test_config());

        assert!(matches!(guardian.tick().await, TickOutcome::Terminated));
        // The exit closed the pair; no transfer was attempted.
        assert!(gateway.transfers().await.is_empty());
        assert_eq!(gateway.perp_position("DOGEUSDT").await, Decimal::ZERO);
    }
}
