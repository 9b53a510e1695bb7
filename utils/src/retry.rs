//! Retry policies for fallible async operations.
//!
//! The operation classifies each failure as [`Attempt::Retry`] or
//! [`Attempt::Abort`]; the policy decides how long to wait between retries
//! and when to give up. A [`StopSignal`] cancels the wait between attempts.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::StopSignal;

/// How a failed attempt should be treated.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Transient failure: try again if the policy allows.
    Retry(E),
    /// Permanent failure: give up immediately.
    Abort(E),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("retry canceled by stop signal")]
    Stopped,

    #[error("{0}")]
    Failed(E),
}

impl<E> RetryError<E> {
    /// The last operation error, if the retry did not end by being stopped.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Stopped => None,
            Self::Failed(e) => Some(e),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_interval: Duration,
    /// Growth factor applied to the interval after every retry.
    pub multiplier: f64,
    pub max_interval: Duration,
    /// No retry is scheduled if it would start after this much time.
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    /// Same delay between every attempt.
    pub fn constant(interval: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_interval: interval,
            multiplier: 1.0,
            max_interval: interval,
            max_elapsed: None,
        }
    }

    /// Doubling delay starting at `initial`, bounded by `max_elapsed` overall.
    pub fn exponential(initial: Duration, max_elapsed: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_interval: initial,
            multiplier: 2.0,
            max_interval: max_elapsed,
            max_elapsed: Some(max_elapsed),
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier.max(1.0)).min(self.max_interval)
    }

    /// Run `op` until it succeeds, aborts, or the policy is exhausted.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Attempt<E>>>,
    {
        self.run_until(None, op).await
    }

    /// Like [`RetryPolicy::run`], but gives up with [`RetryError::Stopped`]
    /// as soon as `stop` fires.
    pub async fn run_until<T, E, F, Fut>(
        &self,
        stop: Option<&StopSignal>,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Attempt<E>>>,
    {
        let started = Instant::now();
        let mut interval = self.initial_interval;
        let mut retries = 0;

        loop {
            if stop.is_some_and(StopSignal::is_stopped) {
                return Err(RetryError::Stopped);
            }

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(Attempt::Abort(err)) => return Err(RetryError::Failed(err)),
                Err(Attempt::Retry(err)) => err,
            };

            if retries >= self.max_retries {
                return Err(RetryError::Failed(err));
            }
            if let Some(max_elapsed) = self.max_elapsed {
                if started.elapsed() + interval > max_elapsed {
                    return Err(RetryError::Failed(err));
                }
            }
            retries += 1;
            tracing::debug!(retry = retries, ?interval, "retrying after transient failure");

            match stop {
                Some(stop) => {
                    tokio::select! {
                        biased;
                        _ = stop.stopped() => return Err(RetryError::Stopped),
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                None => tokio::time::sleep(interval).await,
            }
            interval = self.next_interval(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::constant(Duration::from_millis(500), 3);

        let c = calls.clone();
        let result: Result<u32, RetryError<&str>> = policy
            .run(|| {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Attempt::Retry("busy"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::constant(Duration::from_millis(500), 3);

        let c = calls.clone();
        let result: Result<(), RetryError<&str>> = policy
            .run(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Attempt::Retry("busy"))
                }
            })
            .await;

        assert_eq!(result, Err(RetryError::Failed("busy")));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), RetryError<&str>> = RetryPolicy::constant(Duration::from_secs(1), 5)
            .run(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Attempt::Abort("bad request"))
                }
            })
            .await;

        assert_eq!(result, Err(RetryError::Failed("bad request")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_respects_max_elapsed() {
        let calls = Arc::new(AtomicU32::new(0));
        // 1s + 2s + 4s fit in 10s, the next 8s wait would not.
        let policy = RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(10), 10);

        let c = calls.clone();
        let _: Result<(), RetryError<()>> = policy
            .run(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Attempt::Retry(()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_wait() {
        let stop = StopSignal::new();
        let policy = RetryPolicy::constant(Duration::from_secs(60), 10);

        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.stop();
        });

        let result: Result<(), RetryError<()>> = policy
            .run_until(Some(&stop), || async { Err(Attempt::Retry(())) })
            .await;
        assert_eq!(result, Err(RetryError::Stopped));
    }
}
