//! Risk management: stop-loss tracking and risk-budget sizing.

mod stop_loss;

pub use stop_loss::{RiskManager, StopLossConfig, StopLossState, StopPhase, StopStatus};
