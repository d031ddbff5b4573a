use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use porthole_core::BastionSession;
use porthole_keystore::EphemeralKey;
use russh::keys::ssh_key::private::{Ed25519Keypair, Ed25519PrivateKey, KeypairData};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::socks5::socks5_connect;
use crate::transport::{Transport, TransportFactory, TunnelStream};
use crate::{Result, SshError};

/// Default SSH front-end port on bastion session endpoints.
const SSH_PORT: u16 = 22;

/// Knobs for one dialer.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Optional SOCKS5 proxy (`host:port`) for the outbound TCP leg.
    pub socks5: Option<String>,
    /// Budget for TCP connect + key exchange + auth.
    pub handshake_timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            socks5: None,
            handshake_timeout: Duration::from_secs(20),
        }
    }
}

/// Host keys are not pinned: the endpoint was just issued by the bastion
/// service and the session only admits our ephemeral key, so there is no
/// prior knowledge to check against.
struct AcceptIssuedHostKey;

impl russh::client::Handler for AcceptIssuedHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A live SSH connection to one session front-end.
pub struct SshTransport {
    handle: russh::client::Handle<AcceptIssuedHostKey>,
    ssh_host: String,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("ssh_host", &self.ssh_host)
            .finish()
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| SshError::ChannelOpen(format!("{host}:{port} via {}: {e}", self.ssh_host)))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn keepalive(&self) -> Result<()> {
        if self.handle.is_closed() {
            return Err(SshError::TransportClosed);
        }
        // A session channel open/close round-trip proves the peer is alive
        // without sending data down any forward channel.
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelOpen(format!("keepalive: {e}")))?;
        let _ = channel.close().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "porthole teardown", "")
            .await;
    }
}

/// Dials SSH transports for a single bastion session.
///
/// Holds the session coordinates and a shared reference to the ephemeral
/// key; each `open` produces an independent multiplexed connection.
pub struct SshDialer {
    ssh_host: String,
    ssh_user: String,
    key: Arc<EphemeralKey>,
    options: DialOptions,
}

impl SshDialer {
    pub fn new(session: &BastionSession, key: Arc<EphemeralKey>, options: DialOptions) -> Self {
        Self {
            ssh_host: session.ssh_host.clone(),
            ssh_user: session.ssh_user.clone(),
            key,
            options,
        }
    }

    /// Rebuild the russh signer from the ephemeral seed.
    fn signing_key(&self) -> Result<PrivateKey> {
        let seed = self.key.seed();
        let keypair = Ed25519Keypair::from(Ed25519PrivateKey::from_bytes(&seed));
        PrivateKey::new(KeypairData::Ed25519(keypair), "porthole-ephemeral")
            .map_err(|e| SshError::Key(e.to_string()))
    }

    async fn tcp_connect(&self) -> Result<TcpStream> {
        match &self.options.socks5 {
            Some(proxy) => socks5_connect(proxy, &self.ssh_host, SSH_PORT).await,
            None => TcpStream::connect((self.ssh_host.as_str(), SSH_PORT))
                .await
                .map_err(|e| SshError::NetUnreachable(format!("{}:{SSH_PORT}: {e}", self.ssh_host))),
        }
    }

    async fn handshake(&self) -> Result<SshTransport> {
        let stream = self.tcp_connect().await?;

        let config = Arc::new(russh::client::Config::default());
        let mut handle = russh::client::connect_stream(config, stream, AcceptIssuedHostKey).await?;

        let key = Arc::new(self.signing_key()?);
        let auth = handle
            .authenticate_publickey(
                self.ssh_user.clone(),
                PrivateKeyWithHashAlg::new(key, None),
            )
            .await?;
        if !auth.success() {
            return Err(SshError::AuthFailed(format!(
                "publickey rejected for {}@{}",
                self.ssh_user, self.ssh_host
            )));
        }

        debug!(host = %self.ssh_host, user = %self.ssh_user, "SSH transport established");
        Ok(SshTransport {
            handle,
            ssh_host: self.ssh_host.clone(),
        })
    }
}

#[async_trait]
impl TransportFactory for SshDialer {
    type Transport = SshTransport;

    async fn open(&self, cancel: &CancellationToken) -> Result<Self::Transport> {
        let dial = tokio::time::timeout(self.options.handshake_timeout, self.handshake());
        tokio::select! {
            _ = cancel.cancelled() => Err(SshError::TransportClosed),
            result = dial => match result {
                Ok(transport) => transport,
                Err(_) => {
                    warn!(host = %self.ssh_host, "SSH handshake exceeded its budget");
                    Err(SshError::HandshakeTimeout)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use porthole_core::{ResourceId, SessionState};

    fn session(ssh_host: &str) -> BastionSession {
        BastionSession {
            session_id: ResourceId::new("ocid1.bastionsession.oc1.eu-frankfurt-1.s1"),
            bastion_id: ResourceId::new("ocid1.bastion.oc1.eu-frankfurt-1.b1"),
            target_host: "10.0.0.5".into(),
            target_port: 6443,
            public_key_fingerprint: "SHA256:abc".into(),
            created_at: Utc::now(),
            ttl: Duration::from_secs(1800),
            state: SessionState::Active,
            ssh_host: ssh_host.to_string(),
            ssh_user: "ocid1.bastionsession.oc1.eu-frankfurt-1.s1".into(),
        }
    }

    #[tokio::test]
    async fn test_unreachable_host_is_net_unreachable() {
        // Nothing resolves under .invalid (RFC 2606).
        let dialer = SshDialer::new(
            &session("bastion.invalid"),
            Arc::new(EphemeralKey::generate()),
            DialOptions::default(),
        );
        let err = dialer.open(&CancellationToken::new()).await.unwrap_err();
        assert!(
            matches!(err, SshError::NetUnreachable(_) | SshError::HandshakeTimeout),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_cancel_preempts_dial() {
        let dialer = SshDialer::new(
            &session("bastion.invalid"),
            Arc::new(EphemeralKey::generate()),
            DialOptions::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dialer.open(&cancel).await.unwrap_err();
        assert!(matches!(err, SshError::TransportClosed));
    }

    #[test]
    fn test_signing_key_round_trip() {
        let key = Arc::new(EphemeralKey::generate());
        let dialer = SshDialer::new(&session("h"), key.clone(), DialOptions::default());
        let private = dialer.signing_key().unwrap();
        // The russh signer must present the same public key the bastion
        // authorized.
        let public = private.public_key();
        let openssh = public.to_openssh().unwrap();
        let expected = key.public_openssh().unwrap();
        // Comments may differ in representation; compare the key blob field.
        let blob = |s: &str| s.split_whitespace().nth(1).unwrap().to_string();
        assert_eq!(blob(&openssh), blob(&expected));
    }
}
