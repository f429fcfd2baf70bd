//! # Warden Risk
//!
//! Fleet-wide risk exposure for one user: per-symbol and per-strategy
//! exposure, margin usage, intraday drawdown and the threshold violations
//! derived from them. Everything here is pure computation over a snapshot the
//! caller gathers; nothing is cached between calls.

pub mod aggregator;
pub mod error;
pub mod exposure;

pub use aggregator::ExposureCalculator;
pub use error::RiskError;
pub use exposure::{
    AccountSnapshot, ExposureBucket, ExposureInput, RiskExposure, UNASSIGNED_STRATEGY, Violation,
};
