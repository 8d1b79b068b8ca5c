//! Trading logic: indicators, strategy contract, moving-average strategy.

mod config;
pub mod indicators;
mod moving_average;
mod strategy;

pub use config::{StrategyConfig, StrategyKind};
pub use moving_average::MovingAverageStrategy;
pub use strategy::{build_strategy, Signal, SignalReason, SignalType, Strategy};
