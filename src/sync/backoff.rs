//! Delay policy between retries of a sync task.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_jitter() -> bool {
  true
}

fn default_max_delay() -> f64 {
  300.0
}

/// How long to wait before the next attempt of a failing task.
///
/// In YAML: `{ kind: fixed }` or `{ kind: exponential, jitter: true, max_delay_seconds: 300 }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Backoff {
  /// Always wait the registration's base delay
  Fixed,
  /// Double the base delay per attempt, capped; with jitter the wait is
  /// uniformly drawn from the upper half of the capped delay
  Exponential {
    #[serde(default = "default_jitter")]
    jitter: bool,
    #[serde(default = "default_max_delay")]
    max_delay_seconds: f64,
  },
}

impl Default for Backoff {
  fn default() -> Self {
    Self::Exponential {
      jitter: default_jitter(),
      max_delay_seconds: default_max_delay(),
    }
  }
}

impl Backoff {
  /// Delay after the `attempt`-th failure (1-based).
  pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
    match *self {
      Self::Fixed => base,
      Self::Exponential {
        jitter,
        max_delay_seconds,
      } => {
        let exp = attempt.saturating_sub(1).min(30);
        let raw = base.saturating_mul(1u32 << exp);
        let cap = Duration::try_from_secs_f64(max_delay_seconds.max(0.0))
          .unwrap_or_else(|_| Duration::from_secs_f64(default_max_delay()));
        let capped = raw.min(cap);
        if !jitter || capped.is_zero() {
          return capped;
        }
        let half = capped / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half.saturating_add(Duration::from_millis(spread))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fixed_delay() {
    let b = Backoff::Fixed;
    assert_eq!(b.delay(Duration::from_secs(3), 1), Duration::from_secs(3));
    assert_eq!(b.delay(Duration::from_secs(3), 5), Duration::from_secs(3));
  }

  #[test]
  fn test_exponential_without_jitter() {
    let b = Backoff::Exponential {
      jitter: false,
      max_delay_seconds: 10.0,
    };
    let base = Duration::from_secs(1);
    assert_eq!(b.delay(base, 1), Duration::from_secs(1));
    assert_eq!(b.delay(base, 2), Duration::from_secs(2));
    assert_eq!(b.delay(base, 3), Duration::from_secs(4));
    assert_eq!(b.delay(base, 10), Duration::from_secs(10));
  }

  #[test]
  fn test_jitter_stays_in_upper_half() {
    let b = Backoff::default();
    let base = Duration::from_secs(2);
    for _ in 0..100 {
      let d = b.delay(base, 3);
      assert!(d >= Duration::from_secs(4), "{:?}", d);
      assert!(d <= Duration::from_secs(8), "{:?}", d);
    }
  }

  #[test]
  fn test_unrepresentable_cap_uses_default() {
    let base = Duration::from_secs(1);
    for max_delay_seconds in [f64::INFINITY, 1e300] {
      let b = Backoff::Exponential {
        jitter: false,
        max_delay_seconds,
      };
      assert_eq!(b.delay(base, 20), Duration::from_secs(300));
    }
  }

  #[test]
  fn test_deserialize() {
    let fixed: Backoff = serde_yaml::from_str("kind: fixed").unwrap();
    assert_eq!(fixed, Backoff::Fixed);

    let exp: Backoff = serde_yaml::from_str("kind: exponential").unwrap();
    assert_eq!(exp, Backoff::default());
  }
}
