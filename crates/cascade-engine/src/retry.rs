use std::time::Duration;

use cascade_definition::RetryPolicyDef;

/// Effective retry policy for one step.
///
/// The default policy is a single attempt, so a step without a declared
/// policy never retries. Delays follow
/// `min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub initial_delay: Duration,
  pub backoff_multiplier: f64,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 1,
      initial_delay: Duration::from_millis(500),
      backoff_multiplier: 2.0,
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  pub fn from_def(def: Option<&RetryPolicyDef>) -> Self {
    match def {
      Some(def) => Self {
        max_attempts: def.max_attempts.max(1),
        initial_delay: Duration::from_millis(def.initial_delay_ms),
        backoff_multiplier: def.backoff_multiplier,
        max_delay: Duration::from_millis(def.max_delay_ms),
      },
      None => Self::default(),
    }
  }

  /// Delay before the attempt following failed attempt number `attempt`
  /// (1-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let scaled = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent as i32);
    let capped = scaled.min(self.max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
  }
}
