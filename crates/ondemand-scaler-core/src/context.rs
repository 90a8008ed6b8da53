//! Cooperative cancellation for scaling work.
//!
//! A [`ScaleContext`] combines a [`CancellationToken`] with an optional
//! deadline. Waiters select on [`ScaleContext::done`] and learn *why* they
//! were released, which lets callers tell an explicit cancel (the demand
//! disappeared) from a hung-prevention timeout.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context was cancelled explicitly.
    #[error("context cancelled")]
    Cancelled,
    /// The context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation token plus optional deadline.
#[derive(Debug, Clone)]
pub struct ScaleContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for ScaleContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ScaleContext {
    /// A context that only finishes when cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that also finishes `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A context cancelled together with `parent`, finishing `timeout` from
    /// now if one is given.
    #[must_use]
    pub fn child_of(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token: parent.child_token(),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Cancel the context.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the context finished, or `None` while it is still live.
    #[must_use]
    pub fn error(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            Some(ContextError::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Wait until the context finishes and return why.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.token.cancelled() => ContextError::Cancelled,
                () = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }
}
