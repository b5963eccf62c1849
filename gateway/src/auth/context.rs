use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthError;

/// Per-request deadline and cancellation signal.
///
/// Every store, directory and provider call made on behalf of a request is
/// driven through [`CallContext::run`] so it aborts as soon as the request
/// deadline passes or the caller cancels.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl CallContext {
    #[cfg(test)]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_cancellation(timeout, CancellationToken::new())
    }

    /// `cancel` is usually a child of a server-wide token.
    pub fn with_cancellation(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    #[cfg(test)]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn run<F, T>(&self, fut: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, AuthError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(AuthError::Canceled);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AuthError::Canceled),
            res = tokio::time::timeout_at(self.deadline, fut) => match res {
                Ok(res) => res,
                Err(_) => Err(AuthError::DeadlineExceeded),
            },
        }
    }
}
