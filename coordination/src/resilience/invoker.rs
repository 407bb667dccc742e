//! Backend invocation collaborator

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::BackendId;
use crate::router::TaskProfile;

/// Failure of a single invocation, classified by what the caller should do next
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// Timeouts, transport errors. Worth retrying the same backend.
    #[error("transient: {0}")]
    Transient(String),

    /// The backend failed in a way retrying will not fix. Move on.
    #[error("hard failure: {0}")]
    Hard(String),

    /// The request itself is bad. Stop without trying other backends.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl InvocationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(r) | Self::Hard(r) | Self::Fatal(r) => r,
        }
    }
}

/// Performs the actual call to a backend.
///
/// Implementations must not apply their own timeout; the coordinator bounds
/// every call with the backend's registered timeout.
#[async_trait]
pub trait BackendInvoker: Send + Sync {
    async fn invoke(
        &self,
        backend: &BackendId,
        task: &TaskProfile,
        payload: &str,
    ) -> Result<String, InvocationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(InvocationError::Transient("x".into()).is_retryable());
        assert!(!InvocationError::Hard("x".into()).is_retryable());
        assert!(!InvocationError::Fatal("x".into()).is_retryable());
        assert_eq!(InvocationError::Hard("exit 1".into()).reason(), "exit 1");
    }
}
