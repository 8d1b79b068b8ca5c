//! Error taxonomy for the signal and risk core.

use thiserror::Error;

/// Errors raised by the strategy and risk manager.
///
/// None of these are retried inside the core; they surface to the immediate
/// caller. `InsufficientData` means "skip this cycle", the other two are
/// configuration bugs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TradingError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("insufficient data: need at least {required} bars, got {available}")]
    InsufficientData { required: usize, available: usize },
}

impl TradingError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TradingError>;

/// Exchange rejections that repeating the request cannot fix.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("unknown market: {0}")]
    UnknownMarket(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
