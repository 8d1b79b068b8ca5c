//! Fixed and trailing stop-loss tracking with risk-budget position sizing.
//!
//! A tracked position moves through these phases:
//!
//! ```text
//! Inactive --start_tracking--> FixedStop --profit >= activation--> TrailingStop
//!                                  |                                    |
//!                                  +------- price <= stop --------------+--> Triggered
//! ```
//!
//! The trailing stop follows the highest price seen since entry, not the
//! latest tick, and only ever ratchets upward.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, TradingError};
use crate::models::Position;

fn default_max_loss_pct() -> f64 {
    2.0
}

/// Stop-loss configuration. All percentages are expressed in percent (2.0 = 2%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossConfig {
    /// Initial stop distance below entry
    pub fixed_stop_loss_pct: f64,

    /// Maximum share of balance that a fixed-stop exit may lose
    #[serde(default = "default_max_loss_pct")]
    pub max_loss_pct: f64,

    /// Trailing distance below the highest price seen
    #[serde(default)]
    pub trailing_stop_loss_pct: Option<f64>,

    /// Profit from entry needed before the trailing stop engages
    #[serde(default)]
    pub trailing_activation_pct: Option<f64>,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            fixed_stop_loss_pct: 2.0,
            max_loss_pct: default_max_loss_pct(),
            trailing_stop_loss_pct: Some(1.5),
            trailing_activation_pct: Some(1.0),
        }
    }
}

impl StopLossConfig {
    /// Fixed stop only, trailing disabled.
    pub fn fixed(fixed_stop_loss_pct: f64) -> Self {
        Self {
            fixed_stop_loss_pct,
            max_loss_pct: default_max_loss_pct(),
            trailing_stop_loss_pct: None,
            trailing_activation_pct: None,
        }
    }

    pub fn with_trailing(mut self, trailing_pct: f64, activation_pct: f64) -> Self {
        self.trailing_stop_loss_pct = Some(trailing_pct);
        self.trailing_activation_pct = Some(activation_pct);
        self
    }

    pub fn with_max_loss(mut self, max_loss_pct: f64) -> Self {
        self.max_loss_pct = max_loss_pct;
        self
    }

    /// Trailing needs both the distance and the activation threshold.
    pub fn trailing_enabled(&self) -> bool {
        self.trailing_stop_loss_pct.is_some() && self.trailing_activation_pct.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        check_positive("fixed_stop_loss_pct", Some(self.fixed_stop_loss_pct))?;
        check_positive("max_loss_pct", Some(self.max_loss_pct))?;
        check_positive("trailing_stop_loss_pct", self.trailing_stop_loss_pct)?;
        check_positive("trailing_activation_pct", self.trailing_activation_pct)?;

        if self.fixed_stop_loss_pct >= 100.0 {
            return Err(TradingError::config(format!(
                "fixed_stop_loss_pct must be below 100, got {}",
                self.fixed_stop_loss_pct
            )));
        }
        if let Some(trailing) = self.trailing_stop_loss_pct {
            if trailing >= 100.0 {
                return Err(TradingError::config(format!(
                    "trailing_stop_loss_pct must be below 100, got {trailing}"
                )));
            }
        }
        Ok(())
    }

    fn stop_below(price: f64, pct: f64) -> f64 {
        price * (1.0 - pct / 100.0)
    }
}

fn check_positive(name: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !(v.is_finite() && v > 0.0) => Err(TradingError::config(format!(
            "{name} must be a positive number, got {v}"
        ))),
        _ => Ok(()),
    }
}

/// Phase of the stop-loss state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPhase {
    /// No position tracked
    Inactive,
    /// Position open, trailing not yet engaged
    FixedStop,
    /// Trailing engaged; stop follows the peak
    TrailingStop,
    /// Stop hit; the position must be closed
    Triggered,
}

/// Stop state for one open position.
#[derive(Debug, Clone, PartialEq)]
pub struct StopLossState {
    entry_price: f64,
    highest_price: f64,
    current_stop_price: f64,
    trailing_active: bool,
    triggered: bool,
}

impl StopLossState {
    fn open(entry_price: f64, config: &StopLossConfig) -> Self {
        Self {
            entry_price,
            highest_price: entry_price,
            current_stop_price: StopLossConfig::stop_below(entry_price, config.fixed_stop_loss_pct),
            trailing_active: false,
            triggered: false,
        }
    }

    pub fn entry_price(&self) -> f64 {
        self.entry_price
    }

    pub fn highest_price(&self) -> f64 {
        self.highest_price
    }

    pub fn current_stop_price(&self) -> f64 {
        self.current_stop_price
    }

    pub fn trailing_active(&self) -> bool {
        self.trailing_active
    }

    pub fn phase(&self) -> StopPhase {
        if self.triggered {
            StopPhase::Triggered
        } else if self.trailing_active {
            StopPhase::TrailingStop
        } else {
            StopPhase::FixedStop
        }
    }

    fn status(&self) -> StopStatus {
        StopStatus {
            stop_price: self.current_stop_price,
            triggered: self.triggered,
            trailing_active: self.trailing_active,
            highest_price: self.highest_price,
        }
    }

    fn trailing_stop_price(&self, config: &StopLossConfig) -> Result<f64> {
        let pct = config.trailing_stop_loss_pct.ok_or_else(|| {
            TradingError::config("trailing stop active but trailing_stop_loss_pct is not configured")
        })?;
        Ok(StopLossConfig::stop_below(self.highest_price, pct))
    }

    fn update(&mut self, config: &StopLossConfig, current_price: f64) -> Result<StopStatus> {
        if self.triggered {
            return Ok(self.status());
        }

        if current_price > self.highest_price {
            self.highest_price = current_price;

            if !self.trailing_active {
                if let (Some(_), Some(activation)) =
                    (config.trailing_stop_loss_pct, config.trailing_activation_pct)
                {
                    let profit_pct = (current_price - self.entry_price) / self.entry_price * 100.0;
                    if profit_pct >= activation {
                        self.trailing_active = true;
                        info!(
                            price = current_price,
                            profit_pct = profit_pct,
                            "Trailing stop activated"
                        );
                    }
                }
            }
        }

        if self.trailing_active {
            let candidate = self.trailing_stop_price(config)?;
            if candidate > self.current_stop_price {
                self.current_stop_price = candidate;
                info!(stop = self.current_stop_price, "Trailing stop updated");
            }
        }

        if current_price <= self.current_stop_price {
            self.triggered = true;
            warn!(
                price = current_price,
                stop = self.current_stop_price,
                trailing = self.trailing_active,
                "Stop loss triggered"
            );
        }

        Ok(self.status())
    }
}

/// Result of a stop update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopStatus {
    pub stop_price: f64,
    pub triggered: bool,
    pub trailing_active: bool,
    pub highest_price: f64,
}

impl StopStatus {
    /// Status reported when nothing is tracked.
    pub fn neutral() -> Self {
        Self {
            stop_price: 0.0,
            triggered: false,
            trailing_active: false,
            highest_price: 0.0,
        }
    }
}

/// Owns the stop-loss state of the single tracked position.
///
/// Not internally synchronized: callers serialize `start_tracking` and
/// `update` for a given manager.
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: StopLossConfig,
    state: Option<StopLossState>,
}

impl RiskManager {
    pub fn new(config: StopLossConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    pub fn config(&self) -> &StopLossConfig {
        &self.config
    }

    /// Stop state of the tracked position, if any.
    pub fn state(&self) -> Option<&StopLossState> {
        self.state.as_ref()
    }

    pub fn is_tracking(&self) -> bool {
        self.state.is_some()
    }

    pub fn phase(&self) -> StopPhase {
        self.state
            .as_ref()
            .map_or(StopPhase::Inactive, StopLossState::phase)
    }

    /// Begin tracking a newly opened position. Returns the initial stop price.
    pub fn start_tracking(&mut self, position: &Position) -> Result<f64> {
        self.config.validate()?;
        if !(position.entry_price.is_finite() && position.entry_price > 0.0) {
            return Err(TradingError::invalid_state(format!(
                "cannot track a position with entry price {}",
                position.entry_price
            )));
        }

        let state = StopLossState::open(position.entry_price, &self.config);
        let stop = state.current_stop_price;
        self.state = Some(state);

        info!(
            entry = position.entry_price,
            stop = stop,
            "Started position tracking"
        );
        Ok(stop)
    }

    /// Discard the stop state once the position is closed.
    pub fn stop_tracking(&mut self) {
        if self.state.take().is_some() {
            debug!("Stopped position tracking");
        }
    }

    /// Fold a new price into the stop state.
    ///
    /// With no tracked position this returns [`StopStatus::neutral`]; check
    /// [`is_tracking`](Self::is_tracking) before relying on the result.
    pub fn update(&mut self, current_price: f64) -> Result<StopStatus> {
        match self.state.as_mut() {
            Some(state) => state.update(&self.config, current_price),
            None => Ok(StopStatus::neutral()),
        }
    }

    /// Fixed stop for `price`, or for the tracked entry when `price` is `None`.
    pub fn fixed_stop_price(&self, price: Option<f64>) -> Result<f64> {
        let reference = match (price, self.state.as_ref()) {
            (Some(p), _) => p,
            (None, Some(state)) => state.entry_price,
            (None, None) => {
                return Err(TradingError::invalid_state(
                    "need either a price or an active position",
                ))
            }
        };
        Ok(StopLossConfig::stop_below(reference, self.config.fixed_stop_loss_pct))
    }

    /// Largest size whose fixed-stop exit loses at most `max_loss_pct` of balance.
    pub fn calculate_max_position_size(&self, balance: f64, current_price: f64) -> f64 {
        let max_loss = balance * (self.config.max_loss_pct / 100.0);
        let stop_price = StopLossConfig::stop_below(current_price, self.config.fixed_stop_loss_pct);
        let stop_distance = current_price - stop_price;

        if !(stop_distance > 0.0) {
            return 0.0;
        }
        max_loss / stop_distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn basic_config() -> StopLossConfig {
        StopLossConfig::fixed(2.0)
            .with_trailing(1.5, 1.0)
            .with_max_loss(2.0)
    }

    fn open_at(manager: &mut RiskManager, price: f64) -> f64 {
        manager
            .start_tracking(&Position::new(price, 1.0, Utc::now()))
            .unwrap()
    }

    #[test]
    fn test_trailing_stop_loss() {
        let mut manager = RiskManager::new(basic_config());
        open_at(&mut manager, 1000.0);

        // +1.5% clears the 1% activation threshold
        let status = manager.update(1015.0).unwrap();
        assert!(status.trailing_active);
        assert!(approx(status.stop_price, 999.775));
        assert!(!status.triggered);

        let status = manager.update(1020.0).unwrap();
        assert!(approx(status.stop_price, 1004.7));

        let status = manager.update(1004.0).unwrap();
        assert!(status.triggered);
        assert_eq!(manager.phase(), StopPhase::Triggered);
    }

    #[test]
    fn test_position_sizing() {
        let manager = RiskManager::new(basic_config());
        // $200 budget over a $20 stop distance
        let size = manager.calculate_max_position_size(10000.0, 1000.0);
        assert!(approx(size, 10.0));
    }

    #[test]
    fn test_no_trailing_stop() {
        let mut manager = RiskManager::new(StopLossConfig::fixed(2.0));
        open_at(&mut manager, 1000.0);

        let status = manager.update(1015.0).unwrap();
        assert!(!status.trailing_active);
        assert_eq!(status.stop_price, 980.0);
        assert_eq!(manager.phase(), StopPhase::FixedStop);
    }

    #[test]
    fn test_initial_stop_is_exact() {
        for (price, pct) in [(1000.0, 2.0), (37251.5, 0.75), (0.3371, 5.0)] {
            let mut manager = RiskManager::new(StopLossConfig::fixed(pct));
            let stop = open_at(&mut manager, price);
            assert_eq!(stop, price * (1.0 - pct / 100.0));
            assert_eq!(manager.state().unwrap().highest_price(), price);
        }
    }

    #[test]
    fn test_one_trailing_field_disables_trailing() {
        let mut config = StopLossConfig::fixed(2.0);
        config.trailing_stop_loss_pct = Some(1.5);
        let mut manager = RiskManager::new(config);
        open_at(&mut manager, 1000.0);

        let status = manager.update(1100.0).unwrap();
        assert!(!status.trailing_active);
        assert_eq!(status.stop_price, 980.0);
        assert_eq!(status.highest_price, 1100.0);
    }

    #[test]
    fn test_monotonic_state_across_updates() {
        let mut manager = RiskManager::new(basic_config());
        open_at(&mut manager, 1000.0);

        let prices = [
            1003.0, 1012.0, 1008.0, 1025.0, 1019.0, 1031.0, 1030.0, 1042.0, 1036.0, 1040.0,
        ];
        let mut last_high = 1000.0;
        let mut last_stop = 980.0;
        let mut was_trailing = false;

        for price in prices {
            let status = manager.update(price).unwrap();
            assert!(status.highest_price >= last_high);
            assert!(status.stop_price >= last_stop);
            if was_trailing {
                assert!(status.trailing_active);
            }
            last_high = status.highest_price;
            last_stop = status.stop_price;
            was_trailing = status.trailing_active;
        }
        assert!(was_trailing);
    }

    #[test]
    fn test_trailing_ratchet_never_retreats() {
        let mut manager = RiskManager::new(basic_config());
        open_at(&mut manager, 1000.0);

        let peak = manager.update(1050.0).unwrap().stop_price;
        // Pullback above the stop leaves it in place
        let status = manager.update(1040.0).unwrap();
        assert_eq!(status.stop_price, peak);
        assert!(!status.triggered);
    }

    #[test]
    fn test_triggered_is_terminal() {
        let mut manager = RiskManager::new(StopLossConfig::fixed(2.0));
        open_at(&mut manager, 1000.0);

        assert!(manager.update(979.0).unwrap().triggered);
        // Recovery does not un-trigger the stop
        let status = manager.update(1010.0).unwrap();
        assert!(status.triggered);
        assert_eq!(status.highest_price, 1000.0);
    }

    #[test]
    fn test_update_without_position_is_neutral() {
        let mut manager = RiskManager::new(basic_config());
        assert_eq!(manager.update(1000.0).unwrap(), StopStatus::neutral());
        assert_eq!(manager.phase(), StopPhase::Inactive);
    }

    #[test]
    fn test_stop_tracking_resets_state() {
        let mut manager = RiskManager::new(basic_config());
        open_at(&mut manager, 1000.0);
        manager.update(1020.0).unwrap();
        manager.stop_tracking();

        assert!(!manager.is_tracking());
        assert_eq!(manager.phase(), StopPhase::Inactive);
        // Reopening starts from the fixed stop again
        assert_eq!(open_at(&mut manager, 500.0), 490.0);
        assert!(!manager.state().unwrap().trailing_active());
    }

    #[test]
    fn test_fixed_stop_requires_price_or_position() {
        let mut manager = RiskManager::new(basic_config());
        assert!(matches!(
            manager.fixed_stop_price(None),
            Err(TradingError::InvalidState(_))
        ));
        assert_eq!(manager.fixed_stop_price(Some(1000.0)).unwrap(), 980.0);

        open_at(&mut manager, 500.0);
        assert_eq!(manager.fixed_stop_price(None).unwrap(), 490.0);
    }

    #[test]
    fn test_zero_stop_distance_sizes_to_zero() {
        let manager = RiskManager::new(basic_config());
        assert_eq!(manager.calculate_max_position_size(10000.0, 0.0), 0.0);
        assert_eq!(manager.calculate_max_position_size(10000.0, -5.0), 0.0);
    }

    #[test]
    fn test_invalid_config_rejected_on_tracking() {
        let mut manager = RiskManager::new(StopLossConfig::fixed(0.0));
        let result = manager.start_tracking(&Position::new(1000.0, 1.0, Utc::now()));
        assert!(matches!(result, Err(TradingError::Config(_))));
        assert!(!manager.is_tracking());

        let mut manager = RiskManager::new(StopLossConfig::fixed(2.0).with_trailing(-1.0, 1.0));
        let result = manager.start_tracking(&Position::new(1000.0, 1.0, Utc::now()));
        assert!(matches!(result, Err(TradingError::Config(_))));
    }

    #[test]
    fn test_trailing_without_pct_is_config_error() {
        let mut state = StopLossState::open(1000.0, &StopLossConfig::fixed(2.0));
        state.trailing_active = true;
        let result = state.update(&StopLossConfig::fixed(2.0), 1010.0);
        assert!(matches!(result, Err(TradingError::Config(_))));
    }
}
