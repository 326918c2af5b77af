//! Configuration management for the basis harvester.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Exchange selection and credentials
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Entry filter thresholds
    #[serde(default)]
    pub entry: EntryConfig,
    /// Exit trigger thresholds
    #[serde(default)]
    pub exit: ExitConfig,
    /// Margin rebalancing bands
    #[serde(default)]
    pub margin: MarginConfig,
    /// Global position limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Loop periods
    #[serde(default)]
    pub timing: TimingConfig,
    /// Persistent store location
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Which venue to target
    #[serde(default = "default_exchange_name")]
    pub name: String,
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    /// Quote side of eligible pairs
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    /// Minimum predicted funding rate for the next interval
    #[serde(default = "default_min_funding_rate")]
    pub min_funding_rate: Decimal,
    /// Minimum 24h quote volume
    #[serde(default = "default_min_volume_24h")]
    pub min_volume_24h: Decimal,
    /// Minimum (perp - spot) / spot spread
    #[serde(default = "default_min_spread")]
    pub min_spread: Decimal,
    /// Quote notional per entry
    #[serde(default = "default_notional_per_entry")]
    pub notional_per_entry: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    /// Funding rate at or below which a sample qualifies for exit
    #[serde(default = "default_exit_funding_rate")]
    pub exit_funding_rate: Decimal,
    /// Spread at or below which backwardation profit-take fires
    #[serde(default = "default_exit_spread")]
    pub exit_spread: Decimal,
    /// Consecutive qualifying samples required for the funding-rate exit
    #[serde(default = "default_negative_fr_debounce")]
    pub negative_fr_debounce: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarginConfig {
    /// Margin usage that triggers rebalancing
    #[serde(default = "default_margin_usage_high")]
    pub usage_high: Decimal,
    /// Margin usage rebalancing aims for
    #[serde(default = "default_margin_usage_target")]
    pub usage_target: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrently open positions
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_scanner_period_s")]
    pub scanner_period_s: u64,
    #[serde(default = "default_guardian_period_s")]
    pub guardian_period_s: u64,
    #[serde(default = "default_supervisor_period_s")]
    pub supervisor_period_s: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_exchange_name() -> String {
    "binance".to_string()
}

fn default_quote_currency() -> String {
    "USDT".to_string()
}

fn default_min_funding_rate() -> Decimal {
    Decimal::new(3, 4) // 0.0003 per 8h interval
}

fn default_min_volume_24h() -> Decimal {
    Decimal::new(10_000_000, 0)
}

fn default_min_spread() -> Decimal {
    Decimal::new(2, 3) // 0.002
}

fn default_notional_per_entry() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_exit_funding_rate() -> Decimal {
    Decimal::new(5, 5) // 0.00005
}

fn default_exit_spread() -> Decimal {
    Decimal::new(-1, 2) // -0.01
}

fn default_negative_fr_debounce() -> u32 {
    3
}

fn default_margin_usage_high() -> Decimal {
    Decimal::new(80, 2) // 0.80
}

fn default_margin_usage_target() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_max_open_positions() -> usize {
    3
}

fn default_scanner_period_s() -> u64 {
    60
}

fn default_guardian_period_s() -> u64 {
    10
}

fn default_supervisor_period_s() -> u64 {
    5
}

fn default_db_path() -> String {
    "data/positions.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("BASIS"),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.entry.min_funding_rate > Decimal::ZERO,
            "min_funding_rate must be positive"
        );
        anyhow::ensure!(
            self.entry.min_spread > Decimal::ZERO,
            "min_spread must be positive (entries require contango)"
        );
        anyhow::ensure!(
            self.entry.notional_per_entry > Decimal::ZERO,
            "notional_per_entry must be positive"
        );
        anyhow::ensure!(
            self.exit.exit_spread < Decimal::ZERO,
            "exit_spread must be negative (backwardation)"
        );
        anyhow::ensure!(
            self.exit.negative_fr_debounce >= 1,
            "negative_fr_debounce must be at least 1"
        );
        anyhow::ensure!(
            self.margin.usage_target > Decimal::ZERO
                && self.margin.usage_target < self.margin.usage_high
                && self.margin.usage_high < Decimal::ONE,
            "margin bands must satisfy 0 < usage_target < usage_high < 1"
        );
        anyhow::ensure!(
            self.limits.max_open_positions >= 1,
            "max_open_positions must be at least 1"
        );
        anyhow::ensure!(
            self.timing.scanner_period_s > 0
                && self.timing.guardian_period_s > 0
                && self.timing.supervisor_period_s > 0,
            "loop periods must be positive"
        );
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            entry: EntryConfig::default(),
            exit: ExitConfig::default(),
            margin: MarginConfig::default(),
            limits: LimitsConfig::default(),
            timing: TimingConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: default_exchange_name(),
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
        }
    }
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            quote_currency: default_quote_currency(),
            min_funding_rate: default_min_funding_rate(),
            min_volume_24h: default_min_volume_24h(),
            min_spread: default_min_spread(),
            notional_per_entry: default_notional_per_entry(),
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            exit_funding_rate: default_exit_funding_rate(),
            exit_spread: default_exit_spread(),
            negative_fr_debounce: default_negative_fr_debounce(),
        }
    }
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self {
            usage_high: default_margin_usage_high(),
            usage_target: default_margin_usage_target(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_open_positions: default_max_open_positions(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            scanner_period_s: default_scanner_period_s(),
            guardian_period_s: default_guardian_period_s(),
            supervisor_period_s: default_supervisor_period_s(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.entry.min_funding_rate, dec!(0.0003));
        assert_eq!(config.exit.exit_spread, dec!(-0.01));
        assert_eq!(config.limits.max_open_positions, 3);
    }

    #[test]
    fn inverted_margin_bands_rejected() {
        let mut config = Config::default();
        config.margin.usage_target = dec!(0.9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_debounce_rejected() {
        let mut config = Config::default();
        config.exit.negative_fr_debounce = 0;
        assert!(config.validate().is_err());
    }
}
