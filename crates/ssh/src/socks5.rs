//! Client side of SOCKS5 CONNECT (RFC 1928, NO AUTH).
//!
//! Used to carry the SSH TCP connection through a corporate egress proxy.
//! Only the CONNECT command is implemented; the proxy reply's bound address
//! is read and discarded.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{Result, SshError};

/// Establish a TCP connection to `target_host:target_port` through the
/// SOCKS5 proxy at `proxy`.
pub async fn socks5_connect(proxy: &str, target_host: &str, target_port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy)
        .await
        .map_err(|e| SshError::SocksFailed(format!("connect to proxy {proxy}: {e}")))?;

    // Greeting: VER | NMETHODS | METHODS; we offer NO AUTH only.
    stream
        .write_all(&[0x05, 0x01, 0x00])
        .await
        .map_err(socks_io)?;

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.map_err(socks_io)?;
    if method[0] != 0x05 {
        return Err(SshError::SocksFailed(format!(
            "proxy spoke version {}",
            method[0]
        )));
    }
    if method[1] != 0x00 {
        return Err(SshError::SocksFailed(
            "proxy requires authentication".to_string(),
        ));
    }

    // Request: VER | CMD=CONNECT | RSV | ATYP | DST.ADDR | DST.PORT
    let mut request = vec![0x05, 0x01, 0x00];
    match target_host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => {
            request.push(0x01);
            request.extend_from_slice(&v4.octets());
        }
        Ok(std::net::IpAddr::V6(v6)) => {
            request.push(0x04);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            let host = target_host.as_bytes();
            if host.len() > 255 {
                return Err(SshError::SocksFailed("hostname too long".to_string()));
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host);
        }
    }
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await.map_err(socks_io)?;

    // Reply: VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(socks_io)?;
    if header[1] != 0x00 {
        return Err(SshError::SocksFailed(format!(
            "proxy refused CONNECT (rep {})",
            header[1]
        )));
    }

    let addr_len = match header[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(socks_io)?;
            len[0] as usize
        }
        other => {
            return Err(SshError::SocksFailed(format!(
                "proxy replied with address type {other}"
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await.map_err(socks_io)?;

    debug!(proxy, target_host, target_port, "SOCKS5 CONNECT established");
    Ok(stream)
}

fn socks_io(err: std::io::Error) -> SshError {
    SshError::SocksFailed(err.to_string())
}
