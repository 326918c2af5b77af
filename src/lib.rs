//! # Basis Harvester
//!
//! An unattended delta-neutral funding-rate arbitrage daemon. For each
//! eligible perpetual/spot pair it builds a cash-and-carry position (long
//! spot, short perpetual in equal size) to collect positive funding while
//! staying insensitive to price direction.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Rate-limited, retrying gateway over one venue's spot +
//!   perpetual endpoints
//! - `strategy`: Market scanning and atomic two-leg order execution
//! - `risk`: Per-position guardians (exit triggers, margin rebalancing)
//! - `supervisor`: Position registry, kill switch, drain, entry selection
//! - `persistence`: SQLite position store
//! - `telemetry`: Structured event surface
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod position;
pub mod risk;
pub mod shutdown;
pub mod strategy;
pub mod supervisor;
pub mod telemetry;
pub mod utils;

pub use config::Config;
