use porthole_core::{BastionLifecycle, Classify, ErrorKind, ResourceId};
use porthole_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Bastion {id} cannot host sessions (lifecycle {lifecycle:?})")]
    BastionNotActive {
        id: ResourceId,
        lifecycle: BastionLifecycle,
    },

    #[error("Bastion session quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Session {id} did not become active after {attempts} polls")]
    Timeout { id: ResourceId, attempts: u32 },

    #[error("Session {id} entered state {state}")]
    Terminal { id: ResourceId, state: String },

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

impl Classify for SessionError {
    fn kind(&self) -> ErrorKind {
        match self {
            SessionError::BastionNotActive { .. } | SessionError::QuotaExceeded(_) => {
                ErrorKind::Resource
            }
            SessionError::Timeout { .. } => ErrorKind::Transient,
            SessionError::Terminal { .. } => ErrorKind::Resource,
            SessionError::Cloud(err) => err.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_retryable_by_kind() {
        let err = SessionError::Timeout {
            id: ResourceId::new("s1"),
            attempts: 10,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_resource_errors_not_retryable() {
        let err = SessionError::BastionNotActive {
            id: ResourceId::new("b1"),
            lifecycle: BastionLifecycle::Creating,
        };
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(!err.is_retryable());
    }
}
