//! Convergence poller: the generic bounded-retry evaluator.
//!
//! Two distinct poll modes exist on purpose. `Converge` waits for an
//! eventually-true condition and tolerates any failure until the deadline.
//! `Invariant` asserts a fact that is expected to already hold; a fatal
//! error there propagates immediately instead of burning the deadline,
//! because a genuine consistency violation does not heal through retries.
//! Conflating the two either masks real bugs behind retries or makes a
//! suite flaky on harmless replication lag.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::VerifyError;

/// How a check's failures are treated while polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Loop until the predicate is true; every failure counts as "not yet"
    /// until the deadline lapses.
    Converge,
    /// Transient infrastructure errors still retry, but a fatal error
    /// (an assertion that can never become true) propagates immediately.
    Invariant,
}

/// A bounded-retry evaluator with an absolute wall-clock deadline.
///
/// Constructed fresh per assertion and discarded after resolving; the
/// deadline starts at `await_condition` entry, not at construction.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    timeout: Duration,
    interval: Duration,
}

impl Poller {
    /// Creates a poller, rejecting unusable configurations before any
    /// attempt runs: a zero timeout would silently pass, and an interval
    /// at or above the timeout could never retry.
    pub fn new(timeout: Duration, interval: Duration) -> Result<Self, VerifyError> {
        if timeout.is_zero() {
            return Err(VerifyError::Config(
                "poll timeout must be greater than zero".to_string(),
            ));
        }
        if interval >= timeout {
            return Err(VerifyError::Config(format!(
                "poll interval ({interval:?}) must be strictly less than timeout ({timeout:?})"
            )));
        }
        Ok(Self { timeout, interval })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Repeatedly evaluates `predicate` until it returns true, the deadline
    /// lapses, or (in `Invariant` mode) it fails fatally.
    ///
    /// Success returns immediately with no trailing sleep. On deadline
    /// exhaustion the returned `DeadlineExceeded` carries the last observed
    /// failure for diagnostics.
    pub async fn await_condition<F, Fut>(
        &self,
        mode: PollMode,
        mut predicate: F,
    ) -> Result<(), VerifyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, VerifyError>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0u32;
        let mut last_failure = "predicate never evaluated".to_string();

        loop {
            attempt += 1;
            match predicate().await {
                Ok(true) => {
                    trace!(attempt, "condition met");
                    return Ok(());
                }
                Ok(false) => {
                    last_failure = "condition not yet met".to_string();
                }
                Err(err) if err.is_transient() => {
                    debug!(attempt, error = %err, "transient failure, will retry");
                    last_failure = err.to_string();
                }
                Err(err) => match mode {
                    PollMode::Invariant => return Err(err),
                    PollMode::Converge => {
                        debug!(attempt, error = %err, "check failed, will retry");
                        last_failure = err.to_string();
                    }
                },
            }

            if Instant::now() >= deadline {
                return Err(VerifyError::DeadlineExceeded {
                    timeout: self.timeout,
                    last: last_failure,
                });
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
