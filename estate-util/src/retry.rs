// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Generic retry driver, lifted from the teacher's `retry` crate shape:
//! a `Retrier` holds only the sleep function, the call site supplies a
//! `Duration` iterator (the backoff schedule) and a stream of attempts.

use std::pin::Pin;

use futures::stream::Stream;
use futures::StreamExt;
use tokio::time::Duration;

use estate_error::Error;

/// The outcome of one attempt.
pub enum RetryResult<T> {
    /// The attempt succeeded.
    Ok(T),
    /// A transient failure; try again if the backoff schedule allows.
    Retry(Error),
    /// A permanent failure (bad URL, auth rejected, decode error); stop
    /// immediately without consuming the rest of the retry schedule.
    Err(Error),
}

type SleepFn = Box<dyn Fn(Duration) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync>;

/// Drives a stream of attempts against a backoff schedule until one
/// succeeds or the schedule is exhausted.
pub struct Retrier {
    sleep_fn: SleepFn,
}

impl Retrier {
    #[must_use]
    pub fn new(sleep_fn: SleepFn) -> Self {
        Retrier { sleep_fn }
    }

    /// `retry_config` yields the delay to wait before each retry (not
    /// before the first attempt). `attempts` yields one `RetryResult`
    /// per call; the iterator should be effectively infinite, since this
    /// function stops pulling from it once `retry_config` is exhausted.
    pub async fn retry<T, A>(
        self: Pin<&Self>,
        mut retry_config: impl Iterator<Item = Duration>,
        mut attempts: A,
    ) -> Result<T, Error>
    where
        A: Stream<Item = RetryResult<T>> + Unpin,
    {
        let mut last_err: Option<Error> = None;
        loop {
            match attempts.next().await {
                None => {
                    return Err(last_err.unwrap_or_else(|| {
                        estate_error::make_err!(estate_error::Code::Internal, "attempts stream ended with no results")
                    }))
                }
                Some(RetryResult::Ok(value)) => return Ok(value),
                Some(RetryResult::Err(err)) => return Err(err),
                Some(RetryResult::Retry(err)) => {
                    last_err = Some(err);
                    match retry_config.next() {
                        None => return Err(last_err.unwrap()),
                        Some(delay) => (self.sleep_fn)(delay).await,
                    }
                }
            }
        }
    }
}

/// Builds the exponential-backoff duration iterator described by
/// [`estate_config::RetryConfig`]: `delay_secs * factor^n` for `n` in
/// `0..max_retries`, each jittered by +/-10% so concurrent workers don't
/// retry in lockstep.
pub fn exponential_backoff(delay_secs: f32, factor: f32, max_retries: usize) -> impl Iterator<Item = Duration> {
    (0..max_retries).map(move |attempt| {
        let base = delay_secs * factor.powi(attempt as i32);
        let jitter = 1.0 + (rand::random::<f32>() - 0.5) * 0.2;
        Duration::from_secs_f32((base * jitter).max(0.0))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_error::{make_err, Code};
    use futures::future::ready;
    use futures::stream::repeat_with;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    struct FixedDelay(Duration);
    impl Iterator for FixedDelay {
        type Item = Duration;
        fn next(&mut self) -> Option<Duration> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let retrier = Retrier::new(Box::new(|_| Box::pin(ready(()))));
        let run_count = Arc::new(AtomicI32::new(0));
        let result = Pin::new(&retrier)
            .retry(
                FixedDelay(Duration::from_millis(1)),
                repeat_with(|| {
                    run_count.fetch_add(1, Ordering::Relaxed);
                    RetryResult::Ok(42)
                }),
            )
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(run_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausts_after_configured_retries() {
        let retrier = Retrier::new(Box::new(|_| Box::pin(ready(()))));
        let run_count = Arc::new(AtomicI32::new(0));
        let result: Result<bool, Error> = Pin::new(&retrier)
            .retry(
                FixedDelay(Duration::from_millis(1)).take(2),
                repeat_with(|| {
                    run_count.fetch_add(1, Ordering::Relaxed);
                    RetryResult::Retry(make_err!(Code::Unavailable, "boom"))
                }),
            )
            .await;
        assert_eq!(run_count.load(Ordering::Relaxed), 3);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let retrier = Retrier::new(Box::new(|_| Box::pin(ready(()))));
        let run_count = Arc::new(AtomicI32::new(0));
        let result = Pin::new(&retrier)
            .retry(
                FixedDelay(Duration::from_millis(1)).take(5),
                repeat_with(|| {
                    run_count.fetch_add(1, Ordering::Relaxed);
                    if run_count.load(Ordering::Relaxed) == 3 {
                        return RetryResult::Ok(true);
                    }
                    RetryResult::Retry(make_err!(Code::Unavailable, "boom"))
                }),
            )
            .await
            .unwrap();
        assert!(result);
        assert_eq!(run_count.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn permanent_failure_short_circuits_without_consuming_schedule() {
        let retrier = Retrier::new(Box::new(|_| Box::pin(ready(()))));
        let run_count = Arc::new(AtomicI32::new(0));
        let result: Result<bool, Error> = Pin::new(&retrier)
            .retry(
                FixedDelay(Duration::from_millis(1)).take(5),
                repeat_with(|| {
                    run_count.fetch_add(1, Ordering::Relaxed);
                    RetryResult::Err(make_err!(Code::InvalidArgument, "bad url"))
                }),
            )
            .await;
        assert_eq!(run_count.load(Ordering::Relaxed), 1, "permanent failure should not retry");
        assert!(result.is_err());
    }

    #[test]
    fn exponential_backoff_grows_by_factor() {
        let delays: Vec<Duration> = exponential_backoff(1.0, 2.0, 3).collect();
        assert_eq!(delays.len(), 3);
        // Jitter is +/-10%, so just check monotonic growth within tolerance.
        assert!(delays[1].as_secs_f32() > delays[0].as_secs_f32() * 1.5);
        assert!(delays[2].as_secs_f32() > delays[1].as_secs_f32() * 1.5);
    }
}
