use tokio::net::TcpListener;
use tracing::debug;

use crate::{Result, TunnelError};

/// Bind the loopback listener for a tunnel.
///
/// A zero `requested` asks the OS for an ephemeral port. A nonzero request
/// probes sequential ports upward from it, settling on the lowest free one;
/// running out of port space fails with `NoPortAvailable`.
pub async fn bind_local(requested: u16) -> Result<TcpListener> {
    if requested == 0 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        debug!(port = listener.local_addr()?.port(), "bound ephemeral local port");
        return Ok(listener);
    }

    let mut port = requested;
    loop {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                if port != requested {
                    debug!(requested, bound = port, "requested port busy, probed upward");
                }
                return Ok(listener);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                port = match port.checked_add(1) {
                    Some(next) => next,
                    None => return Err(TunnelError::NoPortAvailable { requested }),
                };
            }
            Err(err) => return Err(err.into()),
        }
    }
}
