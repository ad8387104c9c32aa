use std::{fmt::Display, future::Future, time::Duration};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Bounded retry policy for calls that may fail transiently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// total number of attempts, including the first one
    pub attempts: u32,
    /// delay before the second attempt
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    /// multiplier applied to the delay after every failed attempt (1.0 keeps it fixed)
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay", with = "duration_secs")]
    pub max_delay: Duration,
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(5),
            backoff_multiplier: 1.0,
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
        }
    }

    pub fn exponential(attempts: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            backoff_multiplier: 2.0,
            max_delay,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier.max(1.0))
            .min(self.max_delay.max(self.delay))
    }
}

/// Error returned once every attempt of a retried operation failed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl<E: Display> Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gave up after {} attempt(s), last error: {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryExhausted<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// Runs `operation` until it succeeds or the policy's attempts run out.
///
/// There's no sleep after the last attempt, so a policy of `n` attempts with
/// a fixed delay `d` gives up after `(n - 1) * d`.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.delay;
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("{operation_name} succeeded after {attempt} attempt(s)");
                }

                return Ok(result);
            }
            Err(error) => {
                if attempt >= attempts {
                    warn!("{operation_name} failed after {attempt} attempt(s)! {error}");

                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }

                debug!(
                    "{operation_name} failed (attempt {attempt}/{attempts}), retrying in {}ms... {error}",
                    delay.as_millis()
                );

                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;

        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }

        Ok(Duration::from_secs_f64(secs))
    }
}
