//! Registry owner and main control loop.
//!
//! The supervisor exclusively owns the ActivePosition registry: guardians
//! request mutations over a command channel and every change is persisted
//! before it is visible. It also owns the global controls: the position
//! cap, the kill switch with its drain deadline, and entry selection over
//! the scanner's ranked candidates.

use crate::config::Config;
use crate::error::ExecError;
use crate::exchange::{ExchangeGateway, Venue};
use crate::persistence::PositionStore;
use crate::position::{ActivePosition, PositionStatus};
use crate::risk::{GuardianConfig, PositionGuardian};
use crate::shutdown::KillSwitch;
use crate::strategy::{ExecutionOutcome, OrderManager, TargetCandidate};
use crate::telemetry;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Re-read every supervisor tick; "true" engages the kill switch.
pub const EMERGENCY_STOP_ENV: &str = "EMERGENCY_STOP";

const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Registry mutation requested by a guardian. Applied and persisted by the
/// supervisor task only.
#[derive(Debug)]
pub enum RegistryCommand {
    Transition {
        id: String,
        to: PositionStatus,
    },
    Closed {
        id: String,
        close_fees: Decimal,
    },
    QuantitiesChanged {
        id: String,
        spot_qty: Decimal,
        perp_qty: Decimal,
        total_fees: Decimal,
    },
    ManualIntervention {
        symbol: String,
        reason: String,
    },
}

/// Why the process is exiting; maps onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    CleanShutdown,
    AuthFailure,
    ManualIntervention,
    DrainTimeout,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::CleanShutdown => 0,
            RunOutcome::AuthFailure => 1,
            RunOutcome::ManualIntervention => 2,
            RunOutcome::DrainTimeout => 3,
        }
    }
}

#[derive(Debug, Default)]
struct RunMetrics {
    batches_seen: u64,
    entries: u64,
    exits: u64,
    rebalances: u64,
    errors: u64,
}

pub struct Supervisor {
    config: Config,
    gateway: Arc<dyn ExchangeGateway>,
    orders: Arc<OrderManager>,
    store: PositionStore,
    kill: KillSwitch,
    guardian_config: GuardianConfig,
    /// Live (OPEN/CLOSING) positions keyed by symbol.
    registry: HashMap<String, ActivePosition>,
    commands_tx: mpsc::Sender<RegistryCommand>,
    commands_rx: mpsc::Receiver<RegistryCommand>,
    candidates_rx: mpsc::Receiver<Vec<TargetCandidate>>,
    drain_timeout: Duration,
    manual_intervention: bool,
    metrics: RunMetrics,
}

impl Supervisor {
    pub fn new(
        config: Config,
        gateway: Arc<dyn ExchangeGateway>,
        orders: Arc<OrderManager>,
        store: PositionStore,
        kill: KillSwitch,
        candidates_rx: mpsc::Receiver<Vec<TargetCandidate>>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let guardian_config = GuardianConfig::from_config(&config);
        Self {
            config,
            gateway,
            orders,
            store,
            kill,
            guardian_config,
            registry: HashMap::new(),
            commands_tx,
            commands_rx,
            candidates_rx,
            drain_timeout: DRAIN_TIMEOUT,
            manual_intervention: false,
            metrics: RunMetrics::default(),
        }
    }

    #[cfg(test)]
    fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Verify credentials before anything else; a refused account is fatal.
    pub async fn preflight(&self) -> Result<(), RunOutcome> {
        match self.gateway.fetch_account().await {
            Ok(account) => {
                telemetry::wallet(&account);
                Ok(())
            }
            Err(crate::error::GatewayError::Auth(message)) => {
                error!(message, "gateway refused credentials");
                Err(RunOutcome::AuthFailure)
            }
            Err(e) => {
                warn!(error = %e, "account probe failed (non-auth), continuing");
                Ok(())
            }
        }
    }

    /// Load OPEN/CLOSING rows, check them against live exchange state, retry
    /// CLOSING exits, and resume a guardian per surviving OPEN position.
    /// `Ok(false)` means a discrepancy demands manual intervention.
    pub async fn reconcile_startup(&mut self) -> anyhow::Result<bool> {
        let rows = self.store.load_unclosed()?;
        if rows.is_empty() {
            info!("no persisted positions to reconcile");
            return Ok(true);
        }
        info!(count = rows.len(), "reconciling persisted positions");

        for position in rows {
            let symbol = position.symbol.clone();
            let step = match self
                .gateway
                .fetch_instrument_rules(Venue::Perp, &symbol)
                .await
            {
                Ok(rules) => rules.step_size,
                Err(e) => {
                    telemetry::manual_intervention(&symbol, "instrument rules unavailable");
                    error!(%symbol, error = %e, "cannot verify persisted position");
                    return Ok(false);
                }
            };

            let live_perp = self.gateway.fetch_perp_position(&symbol).await;
            let base = symbol
                .strip_suffix(self.config.entry.quote_currency.as_str())
                .unwrap_or(symbol.as_str());
            let live_spot = self.gateway.fetch_spot_balance(base).await;

            let matches = match (&live_perp, &live_spot) {
                (Ok(perp), Ok(spot)) => {
                    (*perp + position.perp_qty).abs() <= step
                        && *spot + step >= position.spot_qty
                }
                _ => false,
            };
            if !matches {
                telemetry::manual_intervention(
                    &symbol,
                    "persisted position does not match live exchange state",
                );
                error!(
                    %symbol,
                    recorded_spot = %position.spot_qty,
                    recorded_perp = %position.perp_qty,
                    ?live_perp,
                    ?live_spot,
                    "reconciliation mismatch"
                );
                return Ok(false);
            }

            match position.status {
                PositionStatus::Closing => {
                    info!(%symbol, "finishing interrupted exit");
                    match self.orders.execute_exit(&position).await {
                        Ok(summary) => {
                            self.store.update_quantities(
                                &position.id,
                                position.spot_qty,
                                position.perp_qty,
                                position.total_fees + summary.fees(),
                            )?;
                            self.store.update_status(&position.id, PositionStatus::Closed)?;
                        }
                        Err(e) => {
                            error!(%symbol, error = %e, "interrupted exit could not be finished");
                            return Ok(false);
                        }
                    }
                }
                PositionStatus::Open => {
                    info!(%symbol, "resuming guardian for persisted position");
                    self.spawn_guardian(position.clone());
                    self.registry.insert(symbol, position);
                }
                PositionStatus::Closed => unreachable!("load_unclosed filters CLOSED"),
            }
        }
        Ok(true)
    }

    /// Main tick loop. Returns when the process should exit.
    pub async fn run(mut self) -> RunOutcome {
        let mut ticker = interval(Duration::from_secs(self.config.timing.supervisor_period_s));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            max_open_positions = self.config.limits.max_open_positions,
            notional = %self.config.entry.notional_per_entry,
            "supervisor started"
        );

        loop {
            // The select only picks the event; handlers run after its borrows
            // on the channel halves have been released.
            let event = tokio::select! {
                _ = ticker.tick() => Event::Tick,
                Some(command) = self.commands_rx.recv() => Event::Command(command),
                Some(batch) = self.candidates_rx.recv() => Event::Candidates(batch),
            };

            match event {
                Event::Tick => {
                    if emergency_stop_requested() {
                        self.kill.engage("EMERGENCY_STOP environment variable");
                    }
                    if self.manual_intervention || self.orders.entries_halted() {
                        return RunOutcome::ManualIntervention;
                    }
                    if self.kill.is_engaged() {
                        return self.drain().await;
                    }
                    let account = self.gateway.fetch_account().await;
                    if let Ok(account) = account {
                        telemetry::wallet(&account);
                    }
                    debug!(
                        open = self.registry.len(),
                        entries = self.metrics.entries,
                        exits = self.metrics.exits,
                        rebalances = self.metrics.rebalances,
                        errors = self.metrics.errors,
                        "supervisor tick"
                    );
                }
                Event::Command(command) => {
                    self.apply_command(command);
                    if self.manual_intervention {
                        return RunOutcome::ManualIntervention;
                    }
                }
                Event::Candidates(batch) => {
                    self.metrics.batches_seen += 1;
                    if self.kill.is_engaged() || self.orders.entries_halted() {
                        continue;
                    }
                    self.open_from_candidates(batch).await;
                    if self.manual_intervention {
                        return RunOutcome::ManualIntervention;
                    }
                }
            }
        }
    }

    /// Walk the ranked candidates and open positions until the cap is
    /// reached. Requests above the cap are dropped, not queued.
    async fn open_from_candidates(&mut self, batch: Vec<TargetCandidate>) {
        let cap = self.config.limits.max_open_positions;
        for candidate in batch {
            if self.registry.len() >= cap {
                debug!(cap, "position cap reached, dropping remaining candidates");
                break;
            }
            if self.kill.is_engaged() || self.orders.entries_halted() {
                break;
            }
            if self.registry.contains_key(&candidate.symbol) {
                continue;
            }

            let notional = self.config.entry.notional_per_entry;
            match self.orders.execute_entry(&candidate.symbol, notional).await {
                Ok(ExecutionOutcome::BothFilled(position)) => {
                    if let Err(e) = self.store.insert(&position) {
                        error!(
                            symbol = %position.symbol,
                            error = %e,
                            "position opened but could not be persisted"
                        );
                    }
                    self.spawn_guardian(position.clone());
                    self.registry.insert(position.symbol.clone(), position);
                    self.metrics.entries += 1;
                }
                Ok(outcome) => {
                    debug!(symbol = %candidate.symbol, ?outcome, "entry did not complete");
                }
                Err(ExecError::EntriesHalted) => break,
                Err(ExecError::ManualIntervention { .. }) => {
                    self.manual_intervention = true;
                    return;
                }
                Err(e) => {
                    warn!(symbol = %candidate.symbol, error = %e, "entry failed");
                    self.metrics.errors += 1;
                }
            }
        }
    }

    fn spawn_guardian(&self, position: ActivePosition) {
        let guardian = PositionGuardian::new(
            position,
            self.gateway.clone(),
            self.orders.clone(),
            self.guardian_config.clone(),
            self.commands_tx.clone(),
            self.kill.clone(),
        );
        tokio::spawn(guardian.run());
    }

    fn apply_command(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Transition { id, to } => {
                let Some(position) = self.registry.values_mut().find(|p| p.id == id) else {
                    warn!(id, "transition for unknown position");
                    return;
                };
                if let Err(e) = position.transition(to) {
                    debug!(id, error = %e, "transition ignored");
                    return;
                }
                if let Err(e) = self.store.update_status(&id, to) {
                    error!(id, error = %e, "failed to persist status change");
                }
            }
            RegistryCommand::Closed { id, close_fees } => {
                let Some(symbol) = self
                    .registry
                    .values()
                    .find(|p| p.id == id)
                    .map(|p| p.symbol.clone())
                else {
                    warn!(id, "close for unknown position");
                    return;
                };
                let position = self.registry.remove(&symbol).expect("symbol resolved above");
                if let Err(e) = self.store.update_quantities(
                    &id,
                    position.spot_qty,
                    position.perp_qty,
                    position.total_fees + close_fees,
                ) {
                    error!(id, error = %e, "failed to persist close fees");
                }
                if let Err(e) = self.store.update_status(&id, PositionStatus::Closed) {
                    error!(id, error = %e, "failed to persist close");
                }
                self.metrics.exits += 1;
                info!(%symbol, open = self.registry.len(), "position closed");
            }
            RegistryCommand::QuantitiesChanged {
                id,
                spot_qty,
                perp_qty,
                total_fees,
            } => {
                let Some(position) = self.registry.values_mut().find(|p| p.id == id) else {
                    warn!(id, "quantity change for unknown position");
                    return;
                };
                position.spot_qty = spot_qty;
                position.perp_qty = perp_qty;
                position.total_fees = total_fees;
                if let Err(e) = self
                    .store
                    .update_quantities(&id, spot_qty, perp_qty, total_fees)
                {
                    error!(id, error = %e, "failed to persist quantity change");
                }
                self.metrics.rebalances += 1;
            }
            RegistryCommand::ManualIntervention { symbol, reason } => {
                error!(%symbol, reason, "guardian reported manual intervention");
                self.manual_intervention = true;
            }
        }
    }

    /// Guardians are already exiting their positions; wait for the registry
    /// to empty or the drain deadline to pass.
    async fn drain(mut self) -> RunOutcome {
        info!(
            open = self.registry.len(),
            timeout_s = self.drain_timeout.as_secs(),
            "drain started"
        );
        let deadline = Instant::now() + self.drain_timeout;

        while !self.registry.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                error!(open = self.registry.len(), "drain deadline exceeded");
                return RunOutcome::DrainTimeout;
            }
            let received = timeout(deadline - now, self.commands_rx.recv()).await;
            match received {
                Ok(Some(command)) => {
                    self.apply_command(command);
                    if self.manual_intervention {
                        return RunOutcome::ManualIntervention;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    error!(open = self.registry.len(), "drain deadline exceeded");
                    return RunOutcome::DrainTimeout;
                }
            }
        }

        info!(
            entries = self.metrics.entries,
            exits = self.metrics.exits,
            "registry drained, shutting down cleanly"
        );
        RunOutcome::CleanShutdown
    }
}

enum Event {
    Tick,
    Command(RegistryCommand),
    Candidates(Vec<TargetCandidate>),
}

fn emergency_stop_requested() -> bool {
    std::env::var(EMERGENCY_STOP_ENV)
        .map(|v| v == "true")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AccountState, MockGateway};
    use crate::strategy::{ExecTimings, MarketSnapshot};
    use rust_decimal_macros::dec;

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.timing.supervisor_period_s = 1;
        config.timing.guardian_period_s = 1;
        config
    }

    fn candidate(symbol: &str) -> TargetCandidate {
        MarketSnapshot::compute(
            symbol.to_string(),
            dec!(0.0004),
            dec!(0.10),
            dec!(0.1003),
            dec!(20_000_000),
        )
        .unwrap()
    }

    async fn market_gateway(symbols: &[&str]) -> MockGateway {
        let gateway = MockGateway::new();
        for symbol in symbols {
            let base = symbol.trim_end_matches("USDT");
            gateway
                .list_pair(symbol, base, "USDT", dec!(0.10), dec!(0.1003))
                .await;
            gateway.set_funding(symbol, dec!(0.0004)).await;
            gateway.set_volume(symbol, dec!(20_000_000)).await;
        }
        gateway
            .set_account(AccountState {
                withdrawable: dec!(5000),
                margin_in_use: dec!(1000),
                account_equity: dec!(10000),
            })
            .await;
        gateway
    }

    fn supervisor(gateway: &MockGateway, config: Config) -> Supervisor {
        let kill = KillSwitch::new();
        let gateway_arc: Arc<dyn ExchangeGateway> = Arc::new(gateway.clone());
        let orders = Arc::new(OrderManager::with_timings(
            gateway_arc.clone(),
            "USDT",
            kill.clone(),
            ExecTimings {
                leg_timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(10),
                poll_budget: Duration::from_millis(50),
                ambiguity_cap: Duration::from_millis(500),
                exit_backoff: Duration::from_millis(10),
                exit_attempts: 3,
            },
        ));
        let (_tx, candidates_rx) = mpsc::channel(8);
        Supervisor::new(
            config,
            gateway_arc,
            orders,
            PositionStore::open_in_memory().unwrap(),
            kill,
            candidates_rx,
        )
    }

    #[tokio::test]
    async fn cap_limits_concurrent_positions() {
        let symbols = ["AAAUSDT", "BBBUSDT", "CCCUSDT", "DDDUSDT", "EEEUSDT"];
        let gateway = market_gateway(&symbols).await;
        let mut supervisor = supervisor(&gateway, fast_config());

        let batch: Vec<_> = symbols.iter().map(|s| candidate(s)).collect();
        supervisor.open_from_candidates(batch.clone()).await;

        assert_eq!(supervisor.registry.len(), 3);
        assert_eq!(supervisor.metrics.entries, 3);
        // Two legs per entry.
        assert_eq!(gateway.placed_orders().await.len(), 6);

        // A full registry drops every candidate without error.
        supervisor.open_from_candidates(batch).await;
        assert_eq!(supervisor.registry.len(), 3);
        assert_eq!(supervisor.metrics.errors, 0);
        assert_eq!(gateway.placed_orders().await.len(), 6);
    }

    #[tokio::test]
    async fn symbols_already_held_are_skipped() {
        let gateway = market_gateway(&["AAAUSDT"]).await;
        let mut supervisor = supervisor(&gateway, fast_config());

        supervisor
            .open_from_candidates(vec![candidate("AAAUSDT"), candidate("AAAUSDT")])
            .await;

        assert_eq!(supervisor.registry.len(), 1);
        assert_eq!(supervisor.metrics.entries, 1);
    }

    #[tokio::test]
    async fn failed_entries_do_not_occupy_the_registry() {
        let gateway = market_gateway(&["AAAUSDT", "BBBUSDT"]).await;
        gateway
            .push_order_behavior(
                Venue::Perp,
                "AAAUSDT",
                crate::exchange::mock::OrderBehavior::RejectPrePlace("margin cap".into()),
            )
            .await;
        let mut supervisor = supervisor(&gateway, fast_config());

        supervisor
            .open_from_candidates(vec![candidate("AAAUSDT"), candidate("BBBUSDT")])
            .await;

        assert_eq!(supervisor.registry.len(), 1);
        assert!(supervisor.registry.contains_key("BBBUSDT"));
    }

    #[tokio::test]
    async fn kill_switch_drains_to_clean_shutdown() {
        let gateway = market_gateway(&["AAAUSDT"]).await;
        let mut supervisor =
            supervisor(&gateway, fast_config()).with_drain_timeout(Duration::from_secs(15));

        supervisor.open_from_candidates(vec![candidate("AAAUSDT")]).await;
        assert_eq!(supervisor.registry.len(), 1);

        supervisor.kill.engage("test shutdown");
        let outcome = timeout(Duration::from_secs(20), supervisor.run())
            .await
            .expect("drain should finish inside the deadline");

        assert_eq!(outcome, RunOutcome::CleanShutdown);
        assert_eq!(gateway.perp_position("AAAUSDT").await, Decimal::ZERO);
        assert_eq!(gateway.spot_balance("AAA").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn manual_intervention_command_stops_the_loop() {
        let gateway = market_gateway(&[]).await;
        let mut supervisor = supervisor(&gateway, fast_config());

        supervisor.apply_command(RegistryCommand::ManualIntervention {
            symbol: "AAAUSDT".into(),
            reason: "unresolvable leg".into(),
        });
        assert!(supervisor.manual_intervention);
    }

    #[tokio::test]
    async fn reconcile_resumes_matching_open_rows() {
        let gateway = market_gateway(&["AAAUSDT"]).await;
        gateway.set_spot_balance("AAA", dec!(10000)).await;
        gateway.set_perp_position("AAAUSDT", dec!(-10000)).await;

        let mut supervisor = supervisor(&gateway, fast_config());
        let position =
            ActivePosition::open("AAAUSDT", dec!(10000), dec!(10000), dec!(0.003), dec!(0.8))
                .unwrap();
        supervisor.store.insert(&position).unwrap();

        assert!(supervisor.reconcile_startup().await.unwrap());
        assert_eq!(supervisor.registry.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_flags_live_state_mismatch() {
        let gateway = market_gateway(&["AAAUSDT"]).await;
        // Recorded pair, but the exchange shows no short at all.
        gateway.set_spot_balance("AAA", dec!(10000)).await;

        let mut supervisor = supervisor(&gateway, fast_config());
        let position =
            ActivePosition::open("AAAUSDT", dec!(10000), dec!(10000), dec!(0.003), dec!(0.8))
                .unwrap();
        supervisor.store.insert(&position).unwrap();

        assert!(!supervisor.reconcile_startup().await.unwrap());
        assert!(supervisor.registry.is_empty());
    }

    #[tokio::test]
    async fn reconcile_finishes_interrupted_exits() {
        let gateway = market_gateway(&["AAAUSDT"]).await;
        gateway.set_spot_balance("AAA", dec!(10000)).await;
        gateway.set_perp_position("AAAUSDT", dec!(-10000)).await;

        let mut supervisor = supervisor(&gateway, fast_config());
        let mut position =
            ActivePosition::open("AAAUSDT", dec!(10000), dec!(10000), dec!(0.003), dec!(0.8))
                .unwrap();
        supervisor.store.insert(&position).unwrap();
        position.transition(PositionStatus::Closing).unwrap();
        supervisor
            .store
            .update_status(&position.id, PositionStatus::Closing)
            .unwrap();

        assert!(supervisor.reconcile_startup().await.unwrap());
        assert!(supervisor.registry.is_empty());
        assert_eq!(gateway.perp_position("AAAUSDT").await, Decimal::ZERO);
        assert!(supervisor.store.load_unclosed().unwrap().is_empty());
    }

    #[test]
    fn outcomes_map_to_documented_exit_codes() {
        assert_eq!(RunOutcome::CleanShutdown.exit_code(), 0);
        assert_eq!(RunOutcome::AuthFailure.exit_code(), 1);
        assert_eq!(RunOutcome::ManualIntervention.exit_code(), 2);
        assert_eq!(RunOutcome::DrainTimeout.exit_code(), 3);
    }
}
