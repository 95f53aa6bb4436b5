use log::warn;
use std::fmt::Display;
use std::thread;
use std::time::Duration;

use crate::collect::global_variables::{OVERPASS_BACKOFF, OVERPASS_DELAY_SECS, OVERPASS_TRIES};

/// Fixed-count retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub tries: u32,
    /// Wait before the first retry
    pub delay: Duration,
    /// Multiplier applied to the wait after every retry
    pub backoff: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            tries: OVERPASS_TRIES,
            delay: Duration::from_secs(OVERPASS_DELAY_SECS),
            backoff: OVERPASS_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(tries: u32, delay: Duration, backoff: u32) -> Self {
        RetryPolicy {
            tries,
            delay,
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. The last error is returned in the latter cases.
    pub fn run<T, E, F, R>(&self, is_retryable: R, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
        R: Fn(&E) -> bool,
    {
        let tries = self.tries.max(1);
        let mut delay = self.delay;
        let mut attempt = 1;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < tries && is_retryable(&e) => {
                    warn!("{}, retrying in {:?}...", e, delay);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    delay *= self.backoff;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
