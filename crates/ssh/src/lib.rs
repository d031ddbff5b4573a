//! Porthole SSH Transport
//!
//! One [`SshTransport`] is one multiplexed SSH connection to a bastion
//! session's front-end. The dialer authenticates with the session's
//! ephemeral key and accepts whatever host key the issued endpoint
//! presents — the session itself binds the allowed key, so host pinning
//! adds nothing here. An optional SOCKS5 hop carries the underlying TCP
//! when the workstation cannot reach the bastion directly.

mod dialer;
mod error;
mod socks5;
mod transport;

pub use dialer::{DialOptions, SshDialer, SshTransport};
pub use error::{Result, SshError};
pub use socks5::socks5_connect;
pub use transport::{Duplex, Transport, TransportFactory, TunnelStream};
