//! Exponential backoff with jitter for subchannel connection attempts
//! and for re-resolution requests that follow a connection failure.
//!
//! Mirrors the standard gRPC connection-backoff algorithm: see
//! <https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md>.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// How long to wait after the first failure before retrying.
    pub base_delay: Duration,
    /// Factor by which the backoff grows after each failed attempt. Should
    /// be greater than 1.
    pub multiplier: f64,
    /// Fraction of the computed delay to randomize, in `[0, 1]`.
    pub jitter: f64,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
}

/// Default values from the gRPC connection-backoff spec.
pub const DEFAULT_BACKOFF_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
};

impl Default for BackoffConfig {
    fn default() -> Self {
        DEFAULT_BACKOFF_CONFIG
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), &'static str> {
        if self.base_delay > self.max_delay {
            return Err("base_delay must not be greater than max_delay");
        }
        if self.multiplier < 1.0 {
            return Err("multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be in [0, 1]");
        }
        Ok(())
    }
}

/// Stateful exponential-backoff generator. One instance is owned per
/// subchannel and reset whenever that subchannel reaches `READY`.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    /// The delay for the next attempt, before jitter, stored unjittered so
    /// repeated calls grow monotonically regardless of past jitter draws.
    next_delay_secs: Mutex<f64>,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Result<Self, &'static str> {
        config.validate()?;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(Self {
            config,
            next_delay_secs: Mutex::new(next_delay_secs),
        })
    }

    /// Resets the backoff so the next call to `next_backoff` returns
    /// `base_delay` again. Called when a subchannel reconnects successfully.
    pub fn reset(&self) {
        *self.next_delay_secs.lock().unwrap() = self.config.base_delay.as_secs_f64();
    }

    /// Returns the delay to wait before the next connection attempt, and
    /// advances the internal state for the attempt after that.
    pub fn next_backoff(&self) -> Duration {
        let mut next_delay = self.next_delay_secs.lock().unwrap();
        let jittered = *next_delay * (1.0 + self.config.jitter * rand::thread_rng().gen_range(-1.0..1.0));
        *next_delay = self.config.max_delay.as_secs_f64().min(*next_delay * self.config.multiplier);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}
