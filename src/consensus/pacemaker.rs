// Pacemaker - Adaptive round timeouts
//
// Failed rounds lengthen the timeout, successful rounds shorten it, always
// within [min, max].

use super::config::{
    DEFAULT_TIMEOUT_DECREASE_FACTOR, DEFAULT_TIMEOUT_INCREASE_FACTOR, DEFAULT_TIMEOUT_INITIAL_MS,
    DEFAULT_TIMEOUT_MAX_MS, DEFAULT_TIMEOUT_MIN_MS,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Invalid timeout settings
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TimeoutConfigError {
    #[error("timeouts must satisfy 0 < min <= initial <= max (min {min:?}, initial {initial:?}, max {max:?})")]
    Bounds {
        min: Duration,
        initial: Duration,
        max: Duration,
    },

    #[error("increase factor must be greater than 1, got {0}")]
    IncreaseFactor(f64),

    #[error("decrease factor must be in (0, 1], got {0}")]
    DecreaseFactor(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub initial: Duration,
    pub min: Duration,
    pub max: Duration,
    pub increase_factor: f64,
    pub decrease_factor: f64,
}

impl TimeoutConfig {
    pub fn new(
        initial: Duration,
        min: Duration,
        max: Duration,
        increase_factor: f64,
        decrease_factor: f64,
    ) -> Result<Self, TimeoutConfigError> {
        let config = Self {
            initial,
            min,
            max,
            increase_factor,
            decrease_factor,
        };
        config.validate()?;
        Ok(config)
    }

    /// Same timeout for every round
    pub fn fixed(timeout: Duration) -> Self {
        Self {
            initial: timeout,
            min: timeout,
            max: timeout,
            increase_factor: 1.0,
            decrease_factor: 1.0,
        }
    }

    pub fn validate(&self) -> Result<(), TimeoutConfigError> {
        if self.min.is_zero() || self.min > self.initial || self.initial > self.max {
            return Err(TimeoutConfigError::Bounds {
                min: self.min,
                initial: self.initial,
                max: self.max,
            });
        }
        // a fixed config never adapts, so a factor of 1 is fine there
        let fixed = self.min == self.max;
        if !(self.increase_factor > 1.0 || fixed && self.increase_factor == 1.0) {
            return Err(TimeoutConfigError::IncreaseFactor(self.increase_factor));
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor <= 1.0) {
            return Err(TimeoutConfigError::DecreaseFactor(self.decrease_factor));
        }
        Ok(())
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_TIMEOUT_INITIAL_MS),
            min: Duration::from_millis(DEFAULT_TIMEOUT_MIN_MS),
            max: Duration::from_millis(DEFAULT_TIMEOUT_MAX_MS),
            increase_factor: DEFAULT_TIMEOUT_INCREASE_FACTOR,
            decrease_factor: DEFAULT_TIMEOUT_DECREASE_FACTOR,
        }
    }
}

/// Current round timeout, owned by the round loop
#[derive(Debug, Clone)]
pub struct TimeoutController {
    config: TimeoutConfig,
    current: Duration,
}

impl TimeoutController {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            current: config.initial,
            config,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// A round failed: back off
    pub fn on_timeout(&mut self) -> Duration {
        self.current = self.current.mul_f64(self.config.increase_factor).min(self.config.max);
        debug!("Pacemaker: timeout raised to {:?}", self.current);
        self.current
    }

    /// A round succeeded: speed up
    pub fn on_progress(&mut self) -> Duration {
        self.current = self.current.mul_f64(self.config.decrease_factor).max(self.config.min);
        debug!("Pacemaker: timeout lowered to {:?}", self.current);
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_default_is_valid() {
        assert!(TimeoutConfig::default().validate().is_ok());
        assert!(TimeoutConfig::fixed(ms(500)).validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            TimeoutConfig::new(ms(100), ms(200), ms(300), 2.0, 0.5),
            Err(TimeoutConfigError::Bounds { .. })
        ));
        assert!(matches!(
            TimeoutConfig::new(ms(0), ms(0), ms(300), 2.0, 0.5),
            Err(TimeoutConfigError::Bounds { .. })
        ));
        assert!(matches!(
            TimeoutConfig::new(ms(200), ms(100), ms(300), 1.0, 0.5),
            Err(TimeoutConfigError::IncreaseFactor(_))
        ));
        assert!(matches!(
            TimeoutConfig::new(ms(200), ms(100), ms(300), 2.0, 1.5),
            Err(TimeoutConfigError::DecreaseFactor(_))
        ));
    }

    #[test]
    fn test_backoff_is_capped_and_floored() {
        let config = TimeoutConfig::new(ms(1000), ms(500), ms(3000), 2.0, 0.5).unwrap();
        let mut controller = TimeoutController::new(config);

        assert_eq!(controller.on_timeout(), ms(2000));
        assert_eq!(controller.on_timeout(), ms(3000));
        assert_eq!(controller.on_timeout(), ms(3000));

        assert_eq!(controller.on_progress(), ms(1500));
        assert_eq!(controller.on_progress(), ms(750));
        assert_eq!(controller.on_progress(), ms(500));
    }

    #[test]
    fn test_fixed_never_moves() {
        let mut controller = TimeoutController::new(TimeoutConfig::fixed(ms(2000)));
        controller.on_timeout();
        controller.on_progress();
        assert_eq!(controller.current(), ms(2000));
    }
}
