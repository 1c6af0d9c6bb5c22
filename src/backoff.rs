//! Backoff strategies for retry policies

use std::time::Duration;

/// Backoff strategy for retries
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries
    Constant { delay: Duration },
    /// Linearly increasing delay
    Linear { base: Duration },
    /// Exponentially increasing delay with optional cap and growth factor
    Exponential { base: Duration, max: Option<Duration>, factor: f64 },
}

impl Backoff {
    /// Create a constant backoff strategy
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Create a linear backoff strategy
    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    /// Create an exponential backoff strategy with the default growth factor (2.0)
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None, factor: 2.0 }
    }

    /// Set a maximum delay for exponential backoff
    pub fn with_max(mut self, max: Duration) -> Self {
        if let Backoff::Exponential { max: ref mut m, .. } = self {
            *m = Some(max);
        }
        self
    }

    /// Override the growth factor for exponential backoff (default 2.0).
    pub fn with_factor(mut self, factor: f64) -> Self {
        if let Backoff::Exponential { factor: ref mut f, .. } = self {
            *f = factor;
        }
        self
    }

    /// Calculate the delay for a given attempt number (1-indexed)
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => {
                // Use checked_mul to prevent overflow
                base.checked_mul(attempt as u32)
                    .unwrap_or(Duration::from_secs(u64::MAX))
            }
            Backoff::Exponential { base, max, factor } => {
                // delay(k) = base * factor^(k-1), saturating instead of overflowing
                let exponent = attempt.saturating_sub(1) as i32;
                let multiplier = factor.powi(exponent);
                let exp_secs = base.as_secs_f64() * multiplier;
                let exp_delay = if exp_secs.is_finite() && exp_secs >= 0.0 && exp_secs < Duration::MAX.as_secs_f64() {
                    Duration::from_secs_f64(exp_secs)
                } else {
                    Duration::from_secs(u64::MAX)
                };

                if let Some(max) = max {
                    exp_delay.min(*max)
                } else {
                    exp_delay
                }
            }
        }
    }
}
