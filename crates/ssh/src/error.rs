use porthole_core::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("SSH authentication failed: {0}")]
    AuthFailed(String),

    #[error("Network unreachable: {0}")]
    NetUnreachable(String),

    #[error("SSH handshake timed out")]
    HandshakeTimeout,

    #[error("SOCKS5 proxy failed: {0}")]
    SocksFailed(String),

    #[error("Channel open failed: {0}")]
    ChannelOpen(String),

    #[error("Transport is closed")]
    TransportClosed,

    #[error("Key encoding failed: {0}")]
    Key(String),

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),
}

impl Classify for SshError {
    fn kind(&self) -> ErrorKind {
        match self {
            // Publickey rejection means the session/key pairing is wrong.
            SshError::AuthFailed(_) => ErrorKind::Authentication,
            SshError::Key(_) => ErrorKind::Internal,
            SshError::NetUnreachable(_)
            | SshError::HandshakeTimeout
            | SshError::SocksFailed(_)
            | SshError::ChannelOpen(_)
            | SshError::TransportClosed
            | SshError::Protocol(_) => ErrorKind::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, SshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_failures_classify() {
        assert_eq!(
            SshError::AuthFailed("denied".into()).kind(),
            ErrorKind::Authentication
        );
        assert!(SshError::HandshakeTimeout.is_retryable());
        assert!(SshError::NetUnreachable("refused".into()).is_retryable());
        assert!(!SshError::AuthFailed("denied".into()).is_retryable());
    }
}
