//! Bounded concurrent groups that never cancel siblings.

use futures_util::StreamExt;
use futures_util::stream;

use crate::error::{AggregateError, FleetError, TargetFailure};

/// Outcome of a fan-out group: successes in submission order plus every failure.
#[derive(Debug)]
pub struct FanOut<T> {
    pub succeeded: Vec<(String, T)>,
    pub failed: Vec<TargetFailure>,
}

impl<T> FanOut<T> {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    /// Drop the successes and surface failures as one error.
    pub fn into_result(self) -> Result<Vec<(String, T)>, AggregateError> {
        if self.failed.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(AggregateError {
                failures: self.failed,
            })
        }
    }
}

/// Run every labelled task with at most `limit` in flight.
///
/// A failing task does not stop the others; all of them run to completion.
pub async fn fan_out<T, I, F>(limit: usize, tasks: I) -> FanOut<T>
where
    I: IntoIterator<Item = (String, F)>,
    F: Future<Output = Result<T, FleetError>>,
{
    let results: Vec<(String, Result<T, FleetError>)> = stream::iter(tasks)
        .map(|(target, task)| async move { (target, task.await) })
        .buffered(limit.max(1))
        .collect()
        .await;

    let mut out = FanOut {
        succeeded: Vec::new(),
        failed: Vec::new(),
    };
    for (target, result) in results {
        match result {
            Ok(v) => out.succeeded.push((target, v)),
            Err(error) => {
                tracing::debug!(target_name = %target, %error, "fan-out task failed");
                out.failed.push(TargetFailure { target, error });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn failures_do_not_cancel_siblings() {
        let finished = AtomicUsize::new(0);
        let finished = &finished;
        let tasks = (0..4).map(|i| {
            (format!("t{i}"), async move {
                tokio::time::sleep(Duration::from_millis(5 * (4 - i as u64))).await;
                finished.fetch_add(1, Ordering::SeqCst);
                if i == 0 {
                    Err(FleetError::NotFound { id: format!("t{i}") })
                } else {
                    Ok(i)
                }
            })
        });
        let out = fan_out(8, tasks).await;
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        assert_eq!(
            out.succeeded.iter().map(|(t, _)| t.as_str()).collect::<Vec<_>>(),
            ["t1", "t2", "t3"]
        );
        assert_eq!(out.failed.len(), 1);
        assert_eq!(out.failed[0].target, "t0");
        assert!(out.into_result().is_err());
    }

    #[tokio::test]
    async fn respects_limit() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let (in_flight, peak) = (&in_flight, &peak);
        let tasks = (0..10).map(|i| {
            (i.to_string(), async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, FleetError>(())
            })
        });
        let out = fan_out(3, tasks).await;
        assert!(out.is_ok());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
