use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Bidirectional byte stream. Everything the forwarder needs from a channel.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// A forward channel through a transport, ready for byte copying.
pub type TunnelStream = Box<dyn Duplex>;

/// One multiplexed connection capable of carrying forward channels.
///
/// The pool tracks use counts and validity *around* this trait; a transport
/// itself only knows how to open channels and report liveness.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a forward channel to `host:port` behind the session target.
    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream>;

    /// Cheap liveness check used by the pool's prober.
    async fn keepalive(&self) -> Result<()>;

    /// True once the underlying connection is gone; no channel will open.
    fn is_closed(&self) -> bool;

    /// Terminate the connection. Idempotent.
    async fn close(&self);
}

/// Opens transports; the pool owns one factory per session.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport;

    /// Dial a fresh transport. Implementations honor `cancel` promptly.
    async fn open(&self, cancel: &CancellationToken) -> Result<Self::Transport>;
}
