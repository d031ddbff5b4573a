use porthole_core::{Classify, ErrorKind};
use porthole_ssh::SshError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Connection pool is shut down")]
    Closed,

    #[error("Checkout cancelled by caller")]
    Cancelled,

    #[error("No transport became usable within the init deadline")]
    InitTimeout,

    #[error(transparent)]
    Dial(#[from] SshError),
}

impl Classify for PoolError {
    fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Closed => ErrorKind::Resource,
            PoolError::Cancelled | PoolError::InitTimeout => ErrorKind::Transient,
            PoolError::Dial(err) => err.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
