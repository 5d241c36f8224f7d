//! Explicit deadlines threaded through every execution
//!
//! A [`Deadline`] pairs an optional wall-clock instant with a cancellation
//! token. Cleanup work never inherits the caller's deadline: it runs under
//! [`Deadline::cleanup`], a fresh short budget measured from "now".

use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Grace period for teardown after the primary deadline has fired
pub const CLEANUP_GRACE: Duration = Duration::from_secs(5);

/// The generic deadline-exceeded condition
///
/// Every timeout error chains to this value, so callers can detect expiry by
/// walking `source()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Point in time after which an execution must stop
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Option<Instant>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

impl Deadline {
    /// No time limit; only cancellation can stop the execution
    #[must_use]
    pub fn none() -> Self {
        Self {
            at: None,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Expires `timeout` from now
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
            timeout: Some(timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Fresh grace deadline for cleanup, independent of any caller cancellation
    #[must_use]
    pub fn cleanup() -> Self {
        Self::after(CLEANUP_GRACE)
    }

    /// Tie this deadline to a caller-owned cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The earlier of this deadline and `timeout` from now
    ///
    /// A zero `timeout` means "no additional limit".
    #[must_use]
    pub fn tighten(&self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            return self.clone();
        }
        let candidate = Instant::now() + timeout;
        match self.at {
            Some(at) if at <= candidate => self.clone(),
            _ => Self {
                at: Some(candidate),
                timeout: Some(timeout),
                cancel: self.cancel.clone(),
            },
        }
    }

    /// Derived deadline whose token is cancelled with this one, but can also be
    /// cancelled on its own
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            at: self.at,
            timeout: self.timeout,
            cancel: self.cancel.child_token(),
        }
    }

    /// The budget this deadline was created with (zero when unbounded)
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or_default()
    }

    /// Time left, `None` when unbounded
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// True once the instant has passed or the token was cancelled
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.cancel.is_cancelled() || self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Cancel this deadline (and every child)
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves when the deadline passes or is cancelled
    pub async fn expired(&self) {
        match self.at {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Drive `fut` to completion unless the deadline fires first
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, DeadlineExceeded> {
        tokio::select! {
            biased;
            out = fut => Ok(out),
            _ = self.expired() => Err(DeadlineExceeded),
        }
    }
}
