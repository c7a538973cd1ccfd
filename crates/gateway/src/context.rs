//! Per-call cancellation and deadline.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ClassifiedError, GatewayResult};

/// Cancellation token plus optional deadline carried by every public call.
///
/// Cloning shares the token. [`with_timeout`](Self::with_timeout) derives a
/// context whose deadline is the earlier of the existing one and the new
/// window, so nested windows never extend an outer deadline.
#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// A context with a fresh token and no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self { cancel: CancellationToken::new(), deadline: None }
    }

    /// A context observing `token`.
    #[must_use]
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self { cancel: token, deadline: None }
    }

    /// Derives a context that expires `window` from now (or earlier).
    #[must_use]
    pub fn with_timeout(&self, window: Duration) -> Self {
        self.with_deadline(Instant::now() + window)
    }

    /// Derives a context that expires at `deadline` (or earlier).
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self { cancel: self.cancel.clone(), deadline: Some(deadline) }
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cancellation of every operation observing this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether cancellation was requested or the deadline has passed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Returns the reason this context is done, if it is.
    pub(crate) fn check(&self, what: &str) -> GatewayResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ClassifiedError::cancelled(format!("{what} cancelled")));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ClassifiedError::timeout(format!("{what} deadline exceeded")));
        }
        Ok(())
    }

    /// Sleeps for `delay`, waking early with an error on cancellation or
    /// deadline expiry.
    pub(crate) async fn sleep(&self, delay: Duration, what: &str) -> GatewayResult<()> {
        let wake = Instant::now() + delay;
        let deadline = self.deadline.unwrap_or(wake);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                Err(ClassifiedError::cancelled(format!("{what} cancelled during backoff")))
            },
            () = tokio::time::sleep_until(deadline), if deadline < wake => {
                Err(ClassifiedError::timeout(format!("{what} deadline exceeded during backoff")))
            },
            () = tokio::time::sleep_until(wake) => Ok(()),
        }
    }
}
