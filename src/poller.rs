//! Wait-until-true polling with a fixed sampling interval
//!
//! Every attempt re-evaluates the check from scratch; nothing is captured once
//! and re-used across attempts. Errors from the check count as "not yet
//! satisfied" until they repeat often enough to look systemic.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CheckError, PollError, TimeoutError};

/// Default timeout for waiting on a resource state (5 minutes)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default sampling interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);

/// Consecutive failing checks after which polling gives up early
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Lower bound on the sampling interval so a zero interval cannot spin
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Timing parameters for a single [`wait_for`] call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
    /// 0 disables the fail-fast behaviour
    pub max_consecutive_failures: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl PollSettings {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            ..Default::default()
        }
    }

    pub fn from_secs(timeout_secs: u64, interval_secs: u64) -> Self {
        Self::new(
            Duration::from_secs(timeout_secs),
            Duration::from_secs(interval_secs),
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }
}

/// A satisfied wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSuccess {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Call `check` until it returns `Ok(true)` or the timeout elapses.
///
/// No attempt is started at or after the deadline, but an attempt started
/// before it always runs to completion and counts. The sleep between attempts
/// is the only suspension point besides the check itself.
pub async fn wait_for<F, Fut, E>(
    settings: &PollSettings,
    mut check: F,
) -> Result<PollSuccess, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Display,
{
    let start = Instant::now();
    let deadline = start + settings.timeout;
    let interval = settings.interval.max(MIN_INTERVAL);
    let mut attempts: u32 = 0;
    let mut consecutive_failures: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);

        match check().await {
            Ok(true) => {
                debug!(attempts, "condition satisfied");
                return Ok(PollSuccess {
                    attempts,
                    elapsed: start.elapsed(),
                });
            }
            Ok(false) => {
                consecutive_failures = 0;
                debug!(attempts, "condition not yet satisfied");
            }
            Err(e) => {
                consecutive_failures += 1;
                if settings.max_consecutive_failures > 0
                    && consecutive_failures >= settings.max_consecutive_failures
                {
                    return Err(CheckError {
                        attempts,
                        consecutive_failures,
                        message: e.to_string(),
                    }
                    .into());
                }
                warn!(attempts, consecutive_failures, error = %e, "status check failed, retrying");
            }
        }

        tokio::time::sleep(interval).await;

        if Instant::now() >= deadline {
            return Err(TimeoutError {
                elapsed: start.elapsed(),
                attempts,
            }
            .into());
        }
    }
}
