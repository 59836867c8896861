//! Reconnect backoff schedule

use std::time::Duration;

use rand::Rng;

use crate::config::TransportConfig;

/// Exponential backoff with bounded jitter.
///
/// Attempt `n` (1-based) waits `base * factor^(n-1)`, capped at `cap`, then
/// jittered by up to `jitter` of the delay in either direction. The jittered
/// delay never exceeds the cap.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use agrichat::transport::backoff::Backoff;
///
/// let backoff = Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(30), 0.0);
/// assert_eq!(backoff.delay(1), Duration::from_secs(1));
/// assert_eq!(backoff.delay(3), Duration::from_secs(4));
/// assert_eq!(backoff.delay(10), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    cap: Duration,
    jitter: f64,
}

impl Backoff {
    /// Build a schedule from explicit parameters.
    pub fn new(base: Duration, factor: f64, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            factor: factor.max(1.0),
            cap: cap.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Build a schedule from transport configuration.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            config.backoff_factor,
            Duration::from_millis(config.backoff_cap_ms),
            config.backoff_jitter,
        )
    }

    /// Delay before attempt `attempt`, without jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.base.as_millis() as f64 * self.factor.powi(exponent);
        let cap = self.cap.as_millis() as f64;
        Duration::from_millis(millis.min(cap) as u64)
    }

    /// Delay before attempt `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        let jittered = nominal.as_millis() as f64 * (1.0 + spread);
        Duration::from_millis(jittered.clamp(0.0, self.cap.as_millis() as f64) as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}
