//! Deadlines and cancellation for remote calls

use super::RemoteResult;
use crate::error::{BlobdirError, BlobdirResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Wraps every remote call in a per-call timeout and a shared cancellation
/// token
#[derive(Debug, Clone)]
pub struct CallPolicy {
    timeout: Duration,
    cancel: CancellationToken,
}

impl CallPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self::with_token(timeout, CancellationToken::new())
    }

    pub fn with_token(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    /// A policy with the same timeout whose token is cancelled together with
    /// this one, but can also be cancelled on its own
    pub fn child(&self) -> Self {
        Self {
            timeout: self.timeout,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel in-flight and future calls made through this policy
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run one remote call under the deadline and the token
    pub async fn run<T, F>(&self, operation: &str, call: F) -> BlobdirResult<T>
    where
        F: Future<Output = RemoteResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(operation = %operation, "remote call cancelled");
                Err(BlobdirError::Cancelled {
                    operation: operation.to_string(),
                })
            }
            outcome = tokio::time::timeout(self.timeout, call) => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(fault)) => Err(BlobdirError::Remote(fault)),
                Err(_) => Err(BlobdirError::Timeout {
                    operation: operation.to_string(),
                    after: self.timeout,
                }),
            },
        }
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
