use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use porthole_audit::{next_session_uid, AuditEvent, AuditSink, TunnelCoords};
use porthole_core::{
    jittered, BackoffConfig, BastionSession, Classify, PoolConfig, Resolution, TunnelConfig,
};
use porthole_discovery::{Discoverer, ResolveHints};
use porthole_keystore::EphemeralKey;
use porthole_pool::ConnectionPool;
use porthole_session::{SessionEvent, SessionManager};
use porthole_ssh::TransportFactory;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::forwarder::serve;
use crate::listener::bind_local;
use crate::{Result, TunnelError};

/// How long the supervisor waits before retrying a transient resolve.
const RESOLVE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Everything one `start` call needs to know.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub cluster_name: String,
    pub hints: ResolveHints,
    pub tunnel: TunnelConfig,
    pub pool: PoolConfig,
    pub backoff: BackoffConfig,
}

/// One session + pool + forwarder generation. Refresh replaces the whole
/// tuple; forwarders born under a tuple stay with it for their lifetime.
struct Tuple<F: TransportFactory> {
    pool: Arc<ConnectionPool<F>>,
    tracker: TaskTracker,
    session: BastionSession,
    #[allow(dead_code)]
    key: Arc<EphemeralKey>,
}

/// A running tunnel. Dropping the handle does not stop the tunnel; call
/// [`TunnelHandle::stop`] (or let [`TunnelHandle::wait`] observe a
/// self-initiated teardown).
#[derive(Debug)]
pub struct TunnelHandle {
    local_port: u16,
    session_uid: String,
    cancel: CancellationToken,
    done: tokio::task::JoinHandle<()>,
}

impl TunnelHandle {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn session_uid(&self) -> &str {
        &self.session_uid
    }

    /// Tear the tunnel down and wait for every task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.done.await;
    }

    /// Wait until the tunnel stops on its own (session failure with no
    /// replacement, or an external `stop`).
    pub async fn wait(self) {
        let _ = self.done.await;
    }
}

/// Owns the tunnel lifecycle: discovery, key minting, session, pool,
/// listener, forwarders, refresh, audit.
///
/// `connector` builds a transport factory for a given session and key; in
/// production that is an [`porthole_ssh::SshDialer`], in tests anything
/// that satisfies the traits.
pub struct TunnelSupervisor<F, C>
where
    F: TransportFactory,
    C: Fn(&BastionSession, Arc<EphemeralKey>) -> F + Send + Sync + 'static,
{
    discoverer: Arc<Discoverer>,
    sessions: Arc<SessionManager>,
    audit: AuditSink,
    connector: Arc<C>,
}

impl<F, C> TunnelSupervisor<F, C>
where
    F: TransportFactory,
    C: Fn(&BastionSession, Arc<EphemeralKey>) -> F + Send + Sync + 'static,
{
    pub fn new(
        discoverer: Arc<Discoverer>,
        sessions: Arc<SessionManager>,
        audit: AuditSink,
        connector: C,
    ) -> Self {
        Self {
            discoverer,
            sessions,
            audit,
            connector: Arc::new(connector),
        }
    }

    /// Bring a tunnel up. `ready` receives the actually-bound local port
    /// before the accept loop starts.
    pub async fn start(
        &self,
        options: TunnelOptions,
        ready: impl FnOnce(u16) + Send,
    ) -> Result<TunnelHandle> {
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let resolution = self.resolve_with_retry(&options, &cancel).await?;
        if resolution.stale {
            warn!(
                cluster = %options.cluster_name,
                "using stale discovery data; target may have moved"
            );
        }

        let tuple = open_tuple(
            &self.sessions,
            self.connector.as_ref(),
            &resolution,
            &options,
            &cancel,
        )
        .await?;
        let watcher = self.sessions.watch(&tuple.session, &cancel);

        let listener = bind_local(options.tunnel.local_port).await?;
        let local_port = listener.local_addr()?.port();

        let session_uid = next_session_uid();
        let coords = TunnelCoords {
            session_uid: session_uid.clone(),
            cluster_name: resolution.cluster.human_name.clone(),
            region: resolution.cluster.region.clone(),
            bastion_id: resolution.bastion.id.to_string(),
            local_port,
            remote_host: resolution.endpoint.ip.clone(),
            remote_port: resolution.endpoint.port,
        };

        // The CONNECT must be on disk before any forwarded byte moves.
        self.audit.emit(AuditEvent::connect(&coords))?;
        self.audit.flush().await?;

        ready(local_port);
        info!(
            cluster = %coords.cluster_name,
            port = local_port,
            uid = %session_uid,
            "tunnel ready"
        );

        let worker = Worker {
            sessions: self.sessions.clone(),
            audit: self.audit.clone(),
            connector: self.connector.clone(),
            options,
            resolution,
            coords,
            cancel: cancel.clone(),
            started,
            current: Arc::new(RwLock::new(Arc::new(tuple))),
            drainers: TaskTracker::new(),
        };
        let done = tokio::spawn(worker.run(listener, watcher));

        Ok(TunnelHandle {
            local_port,
            session_uid,
            cancel,
            done,
        })
    }

    async fn resolve_with_retry(
        &self,
        options: &TunnelOptions,
        cancel: &CancellationToken,
    ) -> Result<Resolution> {
        match self
            .discoverer
            .resolve(&options.cluster_name, &options.hints, cancel)
            .await
        {
            Ok(resolution) => Ok(resolution),
            Err(err) if err.is_retryable() => {
                let delay = jittered(RESOLVE_RETRY_DELAY, 0.3);
                warn!(%err, ?delay, "discovery failed transiently, retrying once");
                tokio::time::sleep(delay).await;
                Ok(self
                    .discoverer
                    .resolve(&options.cluster_name, &options.hints, cancel)
                    .await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Mint a key, open a session for it, warm a pool over it.
async fn open_tuple<F, C>(
    sessions: &SessionManager,
    connector: &C,
    resolution: &Resolution,
    options: &TunnelOptions,
    cancel: &CancellationToken,
) -> Result<Tuple<F>>
where
    F: TransportFactory,
    C: Fn(&BastionSession, Arc<EphemeralKey>) -> F + Send + Sync + 'static,
{
    let key = Arc::new(EphemeralKey::generate());
    let session = sessions
        .open(
            &resolution.bastion,
            &resolution.endpoint,
            &key.public_openssh()?,
            options.tunnel.session_ttl,
            cancel,
        )
        .await?;
    let factory = connector(&session, key.clone());
    let pool =
        match ConnectionPool::init(factory, options.pool.clone(), options.backoff.clone(), cancel)
            .await
        {
            Ok(pool) => pool,
            Err(err) => {
                // The session was already issued; release it rather than
                // letting it idle out server-side.
                sessions.close(&session, &CancellationToken::new()).await;
                return Err(err.into());
            }
        };
    Ok(Tuple {
        pool: Arc::new(pool),
        tracker: TaskTracker::new(),
        session,
        key,
    })
}

enum RunEnd {
    Stopped,
    Failed(String),
}

struct Worker<F, C>
where
    F: TransportFactory,
    C: Fn(&BastionSession, Arc<EphemeralKey>) -> F + Send + Sync + 'static,
{
    sessions: Arc<SessionManager>,
    audit: AuditSink,
    connector: Arc<C>,
    options: TunnelOptions,
    resolution: Resolution,
    coords: TunnelCoords,
    cancel: CancellationToken,
    started: Instant,
    current: Arc<RwLock<Arc<Tuple<F>>>>,
    /// Old-generation drain tasks spawned by refreshes. Teardown joins
    /// them all, so `stop` never returns with a drain still in flight.
    drainers: TaskTracker,
}

impl<F, C> Worker<F, C>
where
    F: TransportFactory,
    C: Fn(&BastionSession, Arc<EphemeralKey>) -> F + Send + Sync + 'static,
{
    async fn run(self, listener: TcpListener, mut watcher: mpsc::Receiver<SessionEvent>) {
        let accept = self.spawn_accept_loop(listener);
        let end = self.refresh_loop(&mut watcher).await;

        // Teardown: stop accepting, interrupt forwarders, drain, close.
        self.cancel.cancel();
        let _ = accept.await;

        let drain = self.options.tunnel.drain_deadline;
        let tuple = self.current_tuple();
        tuple.tracker.close();
        if tokio::time::timeout(drain, tuple.tracker.wait()).await.is_err() {
            warn!("forwarders still running at the drain deadline");
        }
        tuple.pool.shutdown(drain).await;
        self.sessions
            .close(&tuple.session, &CancellationToken::new())
            .await;

        // Earlier generations may still be draining from refreshes; every
        // one of them must finish before the terminal event is written.
        self.drainers.close();
        self.drainers.wait().await;

        let duration_ns = self.started.elapsed().as_nanos() as u64;
        let event = match end {
            RunEnd::Stopped => AuditEvent::disconnect(&self.coords, duration_ns),
            RunEnd::Failed(message) => {
                warn!(%message, "tunnel ended abnormally");
                AuditEvent::error(&self.coords, duration_ns, message)
            }
        };
        // The terminal event lands after every forwarder has returned and
        // the pool is down.
        let _ = self.audit.emit(event);
        let _ = self.audit.flush().await;
        info!(uid = %self.coords.session_uid, "tunnel stopped");
    }

    fn current_tuple(&self) -> Arc<Tuple<F>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn spawn_accept_loop(&self, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        let current = self.current.clone();
        let cancel = self.cancel.clone();
        let linger = self.options.tunnel.linger;
        let target_host = self.resolution.endpoint.ip.clone();
        let target_port = self.resolution.endpoint.port;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                warn!(%err, "accept failed");
                                continue;
                            }
                        };
                        debug!(%peer, "connection accepted");

                        // Bind the connection to the tuple that is current
                        // at accept time; it keeps that pool for life even
                        // across a refresh swap.
                        let tuple = current.read().unwrap_or_else(|e| e.into_inner()).clone();
                        let pool = tuple.pool.clone();
                        let cancel = cancel.clone();
                        let host = target_host.clone();
                        tuple.tracker.spawn(async move {
                            forward_conn(pool, stream, host, target_port, linger, cancel).await;
                        });
                    }
                }
            }
        })
    }

    async fn refresh_loop(&self, watcher: &mut mpsc::Receiver<SessionEvent>) -> RunEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return RunEnd::Stopped,
                event = watcher.recv() => match event {
                    Some(SessionEvent::RefreshNeeded) => {
                        match self.replace_tuple().await {
                            Ok(new_watcher) => *watcher = new_watcher,
                            Err(err) => {
                                warn!(%err, "session refresh failed; keeping current session until expiry");
                            }
                        }
                    }
                    Some(SessionEvent::Expired) => {
                        return RunEnd::Failed("bastion session expired with no replacement".into());
                    }
                    Some(SessionEvent::Failed(message)) => {
                        return RunEnd::Failed(message);
                    }
                    None => {
                        return RunEnd::Failed("session watcher ended unexpectedly".into());
                    }
                }
            }
        }
    }

    /// Interleave a replacement session + pool, swap atomically, drain the
    /// old tuple in the background.
    async fn replace_tuple(&self) -> Result<mpsc::Receiver<SessionEvent>> {
        info!("refresh window open, preparing replacement session");
        let next = open_tuple(
            &self.sessions,
            self.connector.as_ref(),
            &self.resolution,
            &self.options,
            &self.cancel,
        )
        .await?;
        let watcher = self.sessions.watch(&next.session, &self.cancel);

        let old = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, Arc::new(next))
        };
        info!(
            old_session = %old.session.session_id,
            "pool swapped; draining previous generation"
        );

        let drain = self.options.tunnel.drain_deadline;
        let sessions = self.sessions.clone();
        self.drainers.spawn(async move {
            old.tracker.close();
            if tokio::time::timeout(drain, old.tracker.wait()).await.is_err() {
                warn!("old-generation forwarders hit the drain deadline");
            }
            old.pool.shutdown(drain).await;
            sessions
                .close(&old.session, &CancellationToken::new())
                .await;
            debug!(session = %old.session.session_id, "previous generation torn down");
        });

        Ok(watcher)
    }
}

/// One accepted connection: checkout, channel, copy, check-in.
async fn forward_conn<F: TransportFactory>(
    pool: Arc<ConnectionPool<F>>,
    stream: TcpStream,
    host: String,
    port: u16,
    linger: Duration,
    cancel: CancellationToken,
) {
    let guard = match pool.checkout(&cancel).await {
        Ok(guard) => guard,
        Err(err) => {
            warn!(%err, "no transport available, dropping connection");
            return;
        }
    };
    let remote = match guard.open_tunnel(&host, port).await {
        Ok(remote) => remote,
        Err(err) => {
            warn!(%err, "forward channel open failed");
            pool.checkin(guard, false).await;
            return;
        }
    };
    let outcome = serve(stream, remote, linger, &cancel).await;
    pool.checkin(guard, outcome.ok).await;
}
