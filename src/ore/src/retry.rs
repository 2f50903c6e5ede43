// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.
//!
//! A [`Retry`] describes an exponential backoff policy. Operations are
//! retried via [`Retry::retry_async`], which passes a [`RetryState`] to each
//! attempt so that callers can adjust their logging as the retries pile up.

use std::future::Future;
use std::time::Duration;

/// The number of retries required before upgrading a log level from `debug`
/// to `info`.
pub const INFO_MIN_RETRIES: usize = 5;

/// The state of a retry operation, as observed by each attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryState {
    /// The retry counter, starting from zero on the first try.
    pub i: usize,
    /// The duration that the retry operation will sleep for before the next
    /// retry if this try fails, or `None` if this is the last try.
    pub next_backoff: Option<Duration>,
}

/// Configures a retry operation.
#[derive(Clone, Debug)]
pub struct Retry {
    initial_backoff: Duration,
    factor: f64,
    clamp_backoff: Duration,
    max_tries: usize,
}

impl Default for Retry {
    /// Constructs a retry operation that will retry forever with backoff
    /// defaults that are reasonable for a fallible network operation.
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::MAX,
            max_tries: usize::MAX,
        }
    }
}

impl Retry {
    /// Sets the initial backoff for the retry operation.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Clamps the maximum backoff for the retry operation.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the exponential backoff factor.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Sets the maximum number of tries.
    ///
    /// # Panics
    ///
    /// Panics if `max_tries` is zero.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        assert!(max_tries > 0, "max_tries must be greater than zero");
        self.max_tries = max_tries;
        self
    }

    /// Retries the asynchronous operation `f` according to the configured
    /// policy, returning the first success or the last error.
    pub async fn retry_async<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = Result<T, E>>,
    {
        let mut backoff = self.initial_backoff;
        let mut i = 0;
        loop {
            let last = i + 1 >= self.max_tries;
            let next_backoff = (!last).then(|| backoff.min(self.clamp_backoff));
            match f(RetryState { i, next_backoff }).await {
                Ok(t) => return Ok(t),
                Err(e) => match next_backoff {
                    None => return Err(e),
                    Some(sleep) => {
                        tokio::time::sleep(sleep).await;
                        backoff = Duration::try_from_secs_f64(backoff.as_secs_f64() * self.factor)
                            .unwrap_or(Duration::MAX)
                            .min(self.clamp_backoff);
                        i += 1;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let mut states = vec![];
        let res = Retry::default()
            .initial_backoff(Duration::from_millis(10))
            .clamp_backoff(Duration::from_millis(25))
            .retry_async(|state| {
                states.push(state);
                async move {
                    if state.i < 3 {
                        Err("not yet")
                    } else {
                        Ok(state.i)
                    }
                }
            })
            .await;
        assert_eq!(res, Ok(3));
        let backoffs: Vec<_> = states.iter().map(|s| s.next_backoff).collect();
        assert_eq!(
            backoffs,
            vec![
                Some(Duration::from_millis(10)),
                Some(Duration::from_millis(20)),
                Some(Duration::from_millis(25)),
                Some(Duration::from_millis(25)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_max_tries() {
        let mut tries = 0;
        let res: Result<(), _> = Retry::default()
            .max_tries(2)
            .retry_async(|state| {
                tries += 1;
                async move { Err(state.i) }
            })
            .await;
        assert_eq!(res, Err(1));
        assert_eq!(tries, 2);
    }
}
