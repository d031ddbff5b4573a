use porthole_core::{Classify, ErrorKind};
use thiserror::Error;

/// Tagged errors from the cloud control plane.
///
/// Cancellation surfaces as `Transient("cancelled")`; retry loops exit
/// through their own token checks rather than by matching the message.
#[derive(Error, Debug, Clone)]
pub enum CloudError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Throttled: {0}")]
    Throttled(String),

    #[error("Transient: {0}")]
    Transient(String),

    #[error("Invalid argument: {0}")]
    InvalidArg(String),
}

impl CloudError {
    pub fn cancelled() -> Self {
        CloudError::Transient("cancelled".to_string())
    }
}

impl Classify for CloudError {
    fn kind(&self) -> ErrorKind {
        match self {
            CloudError::Unauthorized(_) => ErrorKind::Authorization,
            CloudError::NotFound(_) => ErrorKind::Resource,
            CloudError::Throttled(_) | CloudError::Transient(_) => ErrorKind::Transient,
            CloudError::InvalidArg(_) => ErrorKind::Configuration,
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
