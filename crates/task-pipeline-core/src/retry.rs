//! Bounded retries with exponential backoff.

use crate::{ExceededRetriesError, PipelineError, Result, Task};
use parking_lot::Mutex;
use std::fmt::Display;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Blocks the calling thread between attempts
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps with `std::thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Records requested sleeps and returns immediately
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn total(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
    }
}

/// Where one task's retry sequence currently stands
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryState {
    /// 1-based attempt number
    pub attempt: u32,
    /// Delay to sleep if this attempt fails
    pub delay: Duration,
}

impl RetryState {
    fn first(base_delay: Duration) -> Self {
        RetryState {
            attempt: 1,
            delay: base_delay,
        }
    }

    fn advance(self, multiplier: f64) -> Self {
        // float-to-int `as` saturates, so huge delays pin at u64::MAX nanos
        let nanos = (self.delay.as_nanos() as f64 * multiplier).round();
        RetryState {
            attempt: self.attempt + 1,
            delay: Duration::from_nanos(nanos as u64),
        }
    }
}

/// Retry policy configuration.
///
/// Delay growth is not capped: after `n` failures the next delay is
/// `base_delay * multiplier^n`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
    multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration, multiplier: f64) -> Result<Self> {
        if attempts == 0 {
            return Err(PipelineError::config("attempts must be >= 1"));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(PipelineError::config(format!(
                "backoff multiplier must be >= 1 (got {})",
                multiplier
            )));
        }

        Ok(Self {
            attempts,
            base_delay,
            multiplier,
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Delays slept after each failed attempt, in order, one per attempt
    pub fn backoff_schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut state = RetryState::first(self.base_delay);
        (0..self.attempts).map(move |_| {
            let delay = state.delay;
            state = state.advance(self.multiplier);
            delay
        })
    }

    /// Run `op` until it succeeds or every attempt has failed.
    ///
    /// A failed attempt is logged and followed by a sleep, including the
    /// final one.
    pub fn run<T, E, F>(
        &self,
        task: &Task,
        sleeper: &dyn Sleeper,
        mut op: F,
    ) -> std::result::Result<T, ExceededRetriesError>
    where
        E: Display,
        F: FnMut(&Task) -> std::result::Result<T, E>,
    {
        let mut state = RetryState::first(self.base_delay);
        loop {
            match op(task) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "Attempt {}/{} failed for task {} {}: {}",
                        state.attempt,
                        self.attempts,
                        task.id(),
                        task,
                        e
                    );
                    sleeper.sleep(state.delay);

                    if state.attempt >= self.attempts {
                        return Err(ExceededRetriesError {
                            task: task.clone(),
                            attempts: state.attempt,
                            last_error: e.to_string(),
                        });
                    }
                    state = state.advance(self.multiplier);
                }
            }
        }
    }
}
