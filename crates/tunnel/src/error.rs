use porthole_core::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error(transparent)]
    Resolve(#[from] porthole_discovery::ResolveError),

    #[error(transparent)]
    Session(#[from] porthole_session::SessionError),

    #[error(transparent)]
    Pool(#[from] porthole_pool::PoolError),

    #[error(transparent)]
    Audit(#[from] porthole_audit::AuditError),

    #[error(transparent)]
    Key(#[from] porthole_keystore::KeystoreError),

    #[error("No free local port at or above {requested}")]
    NoPortAvailable { requested: u16 },

    #[error("Listener I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for TunnelError {
    fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Resolve(err) => err.kind(),
            TunnelError::Session(err) => err.kind(),
            TunnelError::Pool(err) => err.kind(),
            TunnelError::Audit(_) => ErrorKind::Internal,
            TunnelError::Key(_) => ErrorKind::Internal,
            TunnelError::NoPortAvailable { .. } => ErrorKind::Resource,
            TunnelError::Io(_) => ErrorKind::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
