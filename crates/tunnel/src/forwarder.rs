//! Per-connection byte pipeline.
//!
//! Two independent copy loops move bytes between the accepted local socket
//! and the forward channel. The first EOF half-closes the opposite write
//! side so pipelined responses can still drain; after a linger (or the
//! second EOF) both sides come down.

use std::time::Duration;

use porthole_ssh::TunnelStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Copy buffer size per direction.
const COPY_BUF: usize = 32 * 1024;

/// How one forwarded connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    /// False when either copy loop hit an I/O error (EOF is not an error);
    /// feeds the pool's suspect marking at check-in.
    pub ok: bool,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

enum CopyEnd {
    Eof(u64),
    Failed(u64),
}

async fn copy_half<R, W>(mut from: R, mut to: W) -> CopyEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        match from.read(&mut buf).await {
            Ok(0) => {
                // Propagate the half-close so the peer sees EOF.
                let _ = to.shutdown().await;
                return CopyEnd::Eof(total);
            }
            Ok(n) => {
                total += n as u64;
                if to.write_all(&buf[..n]).await.is_err() {
                    return CopyEnd::Failed(total);
                }
            }
            Err(_) => {
                let _ = to.shutdown().await;
                return CopyEnd::Failed(total);
            }
        }
    }
}

/// Run one forwarded connection until both directions finish, the linger
/// expires after the first EOF, or cancellation lands mid-copy.
pub async fn serve(
    local: TcpStream,
    remote: TunnelStream,
    linger: Duration,
    cancel: &CancellationToken,
) -> ForwardOutcome {
    let (local_read, local_write) = local.into_split();
    let (remote_read, remote_write) = tokio::io::split(remote);

    let up = copy_half(local_read, remote_write);
    let down = copy_half(remote_read, local_write);
    tokio::pin!(up);
    tokio::pin!(down);

    let mut bytes_up = 0u64;
    let mut bytes_down = 0u64;
    let mut ok = true;

    enum Remaining {
        Up,
        Down,
    }
    let remaining = tokio::select! {
        _ = cancel.cancelled() => {
            trace!("forwarder interrupted mid-copy");
            return ForwardOutcome { ok: true, bytes_up, bytes_down };
        }
        end = &mut up => {
            match end {
                CopyEnd::Eof(n) => bytes_up = n,
                CopyEnd::Failed(n) => { bytes_up = n; ok = false; }
            }
            Remaining::Down
        }
        end = &mut down => {
            match end {
                CopyEnd::Eof(n) => bytes_down = n,
                CopyEnd::Failed(n) => { bytes_down = n; ok = false; }
            }
            Remaining::Up
        }
    };

    // Let the surviving direction drain until its own EOF, bounded by the
    // linger, still interruptible by teardown.
    tokio::select! {
        _ = cancel.cancelled() => {
            trace!("forwarder interrupted during linger");
        }
        _ = tokio::time::sleep(linger) => {
            debug!("linger expired before second EOF");
        }
        end = &mut down, if matches!(remaining, Remaining::Down) => {
            match end {
                CopyEnd::Eof(n) => bytes_down = n,
                CopyEnd::Failed(n) => { bytes_down = n; ok = false; }
            }
        }
        end = &mut up, if matches!(remaining, Remaining::Up) => {
            match end {
                CopyEnd::Eof(n) => bytes_up = n,
                CopyEnd::Failed(n) => { bytes_up = n; ok = false; }
            }
        }
    }

    debug!(bytes_up, bytes_down, ok, "forwarder finished");
    ForwardOutcome {
        ok,
        bytes_up,
        bytes_down,
    }
}
