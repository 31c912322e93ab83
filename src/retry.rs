use std::time::Duration;

use crate::error::FleetError;

/// Bounded retry budget with optional exponential growth between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub factor: f64,
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            initial: interval,
            factor: 1.0,
        }
    }

    pub fn backoff(attempts: u32, initial: Duration) -> Self {
        Self {
            attempts,
            initial,
            factor: 1.5,
        }
    }

    /// Delay before attempt `n + 1`, where `n` counts from zero.
    pub fn delay(&self, n: u32) -> Duration {
        self.initial.mul_f64(self.factor.powi(n as i32))
    }
}

/// Run `op` until it succeeds or the budget is spent, returning the last error.
///
/// Errors that cannot heal on their own end the loop at once. The closure
/// receives the zero-based attempt number.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, FleetError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FleetError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 >= attempts || !e.is_retryable() => return Err(e),
            Err(e) => {
                let wait = policy.delay(attempt);
                tracing::debug!(
                    target_name = label,
                    attempt = attempt + 1,
                    of = attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}
