//! Trading strategy core.
//!
//! - Market scanning and candidate ranking
//! - Atomic two-leg order execution

mod executor;
mod scanner;

pub use executor::{
    CloseSummary, ExecTimings, ExecutionOutcome, Leg, OrderManager,
};
pub use scanner::{MarketScanner, MarketSnapshot, TargetCandidate};
