use std::time;

use thiserror::Error;

/// Enumeration of reasons a `ProbeConfig` can be rejected at startup.
#[derive(Error, Debug, PartialEq)]
pub enum ProbeConfigError {
    #[error("max_attempts must be at least 1")]
    NoAttempts,
    #[error("initial_delay must be greater than zero")]
    ZeroInitialDelay,
    #[error("backoff_factor must be a finite number greater than 1, got {0}")]
    InvalidFactor(f64),
    #[error("initial_delay {initial:?} is larger than max_delay {maximum:?}")]
    InitialDelayAboveMaximum {
        initial: time::Duration,
        maximum: time::Duration,
    },
}

#[derive(Copy, Clone, Debug, PartialEq)]
/// The backoff policy used while waiting for the database to accept connections.
pub struct ProbeConfig {
    /// How many liveness checks to run before giving up.
    max_attempts: u32,
    /// The delay after the first failed attempt.
    initial_delay: time::Duration,
    /// The maximum possible delay between attempts.
    max_delay: time::Duration,
    /// Coefficient to multiply the delay with after every failed attempt.
    backoff_factor: f64,
}

impl ProbeConfig {
    pub fn new(
        max_attempts: u32,
        initial_delay: time::Duration,
        max_delay: time::Duration,
        backoff_factor: f64,
    ) -> Result<Self, ProbeConfigError> {
        if max_attempts == 0 {
            return Err(ProbeConfigError::NoAttempts);
        }
        if initial_delay.is_zero() {
            return Err(ProbeConfigError::ZeroInitialDelay);
        }
        if !backoff_factor.is_finite() || backoff_factor <= 1.0 {
            return Err(ProbeConfigError::InvalidFactor(backoff_factor));
        }
        if initial_delay > max_delay {
            return Err(ProbeConfigError::InitialDelayAboveMaximum {
                initial: initial_delay,
                maximum: max_delay,
            });
        }

        Ok(Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_factor,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> time::Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> time::Duration {
        self.max_delay
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    /// Delay to wait after a failed attempt, given the delay used after the previous one.
    /// Repeated application rounds through f64 at every step, so it can drift from
    /// `delay_for_attempt` by a few nanoseconds after many attempts.
    pub fn next_delay(&self, prior: time::Duration) -> time::Duration {
        self.capped(prior.as_secs_f64() * self.backoff_factor)
    }

    /// Closed form of `next_delay`: the delay following the failure of `attempt`, counting from 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> time::Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);

        self.capped(self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent))
    }

    fn capped(&self, candidate_secs: f64) -> time::Duration {
        // Overflowing to infinity is expected for large attempts.
        if candidate_secs.is_finite() && candidate_secs < self.max_delay.as_secs_f64() {
            time::Duration::from_secs_f64(candidate_secs)
        } else {
            self.max_delay
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: time::Duration::from_secs(2),
            max_delay: time::Duration::from_secs(10),
            backoff_factor: 1.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rejects_zero_attempts() {
        let result = ProbeConfig::new(0, Duration::from_secs(1), Duration::from_secs(2), 2.0);

        assert_eq!(result, Err(ProbeConfigError::NoAttempts));
    }

    #[test]
    fn rejects_zero_initial_delay() {
        let result = ProbeConfig::new(3, Duration::ZERO, Duration::from_secs(2), 2.0);

        assert_eq!(result, Err(ProbeConfigError::ZeroInitialDelay));
    }

    #[test]
    fn rejects_factors_that_do_not_grow() {
        for factor in [1.0, 0.5, -2.0, f64::INFINITY] {
            let result =
                ProbeConfig::new(3, Duration::from_secs(1), Duration::from_secs(2), factor);
            assert_eq!(result, Err(ProbeConfigError::InvalidFactor(factor)));
        }

        let nan = ProbeConfig::new(3, Duration::from_secs(1), Duration::from_secs(2), f64::NAN);
        assert!(matches!(nan, Err(ProbeConfigError::InvalidFactor(_))));
    }

    #[test]
    fn rejects_initial_delay_above_maximum() {
        let result = ProbeConfig::new(3, Duration::from_secs(5), Duration::from_secs(2), 2.0);

        assert!(matches!(
            result,
            Err(ProbeConfigError::InitialDelayAboveMaximum { .. })
        ));
    }

    #[test]
    fn default_policy_grows_then_caps() {
        let config = ProbeConfig::default();

        let delays: Vec<Duration> = (1..=6).map(|k| config.delay_for_attempt(k)).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(2000),
                Duration::from_millis(3000),
                Duration::from_millis(4500),
                Duration::from_millis(6750),
                Duration::from_millis(10000),
                Duration::from_millis(10000),
            ]
        );
    }

    #[test]
    fn next_delay_agrees_with_closed_form() {
        let config =
            ProbeConfig::new(12, Duration::from_millis(125), Duration::from_secs(30), 2.0).unwrap();

        let mut delay = config.initial_delay();
        for attempt in 1..=12 {
            assert_eq!(delay, config.delay_for_attempt(attempt), "attempt {attempt}");
            delay = config.next_delay(delay);
        }
    }

    #[test]
    fn next_delay_stays_close_to_closed_form_for_inexact_factors() {
        for factor in [1.1, 1.5, 1.7] {
            let config =
                ProbeConfig::new(40, Duration::from_millis(100), Duration::from_secs(3600), factor)
                    .unwrap();

            let mut delay = config.initial_delay();
            for attempt in 1..=40 {
                let exact = config.delay_for_attempt(attempt);
                let drift = if delay > exact { delay - exact } else { exact - delay };
                assert!(
                    drift <= Duration::from_micros(1),
                    "factor {factor} attempt {attempt}: {delay:?} vs {exact:?}"
                );
                delay = config.next_delay(delay);
            }
        }
    }

    #[test]
    fn huge_attempts_stay_capped() {
        let config =
            ProbeConfig::new(u32::MAX, Duration::from_secs(1), Duration::from_secs(60), 10.0)
                .unwrap();

        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(60));
        assert_eq!(
            config.next_delay(Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }
}
