use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use porthole_core::{jittered, Backoff, BackoffConfig, Classify, PoolConfig};
use porthole_ssh::{Transport, TransportFactory};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tracked::Tracked;
use crate::{PoolError, PooledTransport, Result};

/// Budget for one keepalive probe round-trip.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fraction of jitter applied to the probe period.
const PROBE_JITTER: f64 = 0.25;

/// Point-in-time view of the pool, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Live (non-invalid) transports.
    pub transports: usize,
    /// Use counts of live transports, ascending.
    pub use_counts: Vec<usize>,
    /// Members condemned but not yet drained and closed.
    pub draining: usize,
}

struct Table<T: Transport> {
    transports: Vec<Arc<Tracked<T>>>,
    opening: usize,
}

pub(crate) struct Shared<F: TransportFactory> {
    factory: F,
    config: PoolConfig,
    dial_backoff: BackoffConfig,
    table: Mutex<Table<F::Transport>>,
    notify: Notify,
    closed: CancellationToken,
    next_id: AtomicU64,
}

impl<F: TransportFactory> Shared<F> {
    pub(crate) fn notify_slot(&self) {
        self.notify.notify_one();
    }

    fn snapshot_members(&self) -> Vec<Arc<Tracked<F::Transport>>> {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transports
            .clone()
    }

    fn remove_member(&self, id: u64) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.transports.retain(|t| t.id != id);
    }

    fn admit(&self, transport: F::Transport) -> Arc<Tracked<F::Transport>> {
        let tracked = Arc::new(Tracked::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            transport,
        ));
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.transports.push(tracked.clone());
        tracked
    }
}

/// Owns up to `size` transports for one session and hands out bounded,
/// guarded checkouts.
pub struct ConnectionPool<F: TransportFactory> {
    shared: Arc<Shared<F>>,
    prober: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<F: TransportFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").finish()
    }
}

impl<F: TransportFactory> ConnectionPool<F> {
    /// Warm up and start the prober. Fails only if not a single transport
    /// becomes usable within `config.init_deadline` (given `warmup > 0`).
    pub async fn init(
        factory: F,
        config: PoolConfig,
        dial_backoff: BackoffConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            factory,
            config: config.clone(),
            dial_backoff,
            table: Mutex::new(Table {
                transports: Vec::new(),
                opening: 0,
            }),
            notify: Notify::new(),
            closed: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        });

        let want = config.warmup.min(config.size);
        for n in 0..want {
            let shared = shared.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                warmup_one(shared, cancel, n).await;
            });
        }

        if want > 0 {
            let deadline = tokio::time::sleep(config.init_deadline);
            tokio::pin!(deadline);
            loop {
                if !shared.snapshot_members().is_empty() {
                    break;
                }
                tokio::select! {
                    _ = &mut deadline => {
                        shared.closed.cancel();
                        return Err(PoolError::InitTimeout);
                    }
                    _ = cancel.cancelled() => {
                        shared.closed.cancel();
                        return Err(PoolError::Cancelled);
                    }
                    _ = shared.notify.notified() => {}
                }
            }
        }

        let prober = {
            let shared = shared.clone();
            tokio::spawn(async move {
                probe_loop(shared).await;
            })
        };

        info!(
            size = config.size,
            warmup = want,
            "connection pool initialized"
        );
        Ok(Self {
            shared,
            prober: Mutex::new(Some(prober)),
        })
    }

    /// Check out a transport with spare channel capacity.
    ///
    /// Blocks until capacity frees up or a new transport can be opened;
    /// there is no internal deadline — only `cancel` (or shutdown) ends the
    /// wait. Waiters wake oldest-first; among candidates the lowest
    /// use-count wins.
    pub async fn checkout(&self, cancel: &CancellationToken) -> Result<PooledTransport<F>> {
        let shared = &self.shared;
        let max_uses = shared.config.max_uses_per_conn;
        let mut dial_backoff = Backoff::new(shared.dial_backoff.clone());

        loop {
            if shared.closed.is_cancelled() {
                return Err(PoolError::Closed);
            }
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }

            // Pass 1: an existing transport with spare capacity.
            let mut best: Option<(usize, Arc<Tracked<F::Transport>>)> = None;
            for tracked in shared.snapshot_members() {
                if tracked.transport.is_closed() {
                    if tracked.mark_invalid() {
                        shared.remove_member(tracked.id);
                        tracked.transport.close().await;
                    }
                    continue;
                }
                let snap = tracked.snapshot();
                if snap.invalid || snap.use_count >= max_uses {
                    continue;
                }
                match &best {
                    Some((count, _)) if *count <= snap.use_count => {}
                    _ => best = Some((snap.use_count, tracked)),
                }
            }
            if let Some((_, tracked)) = best {
                if tracked.try_acquire(max_uses) {
                    return Ok(PooledTransport::new(tracked, shared.clone()));
                }
                // Lost the race for the last slot; take another look.
                continue;
            }

            // Pass 2: open a fresh transport if the table has room.
            let may_open = {
                let mut table = shared.table.lock().unwrap_or_else(|e| e.into_inner());
                if table.transports.len() + table.opening < shared.config.size {
                    table.opening += 1;
                    true
                } else {
                    false
                }
            };

            if may_open {
                let result = shared.factory.open(cancel).await;
                {
                    let mut table = shared.table.lock().unwrap_or_else(|e| e.into_inner());
                    table.opening -= 1;
                }
                match result {
                    Ok(transport) => {
                        let tracked = shared.admit(transport);
                        debug!(id = tracked.id, "transport opened on demand");
                        // Let queued waiters at the spare slots.
                        for _ in 1..max_uses {
                            shared.notify.notify_one();
                        }
                        if tracked.try_acquire(max_uses) {
                            return Ok(PooledTransport::new(tracked, shared.clone()));
                        }
                        continue;
                    }
                    Err(err) if err.is_retryable() => {
                        let delay = dial_backoff.next_delay();
                        if dial_backoff.exhausted() {
                            dial_backoff.reset();
                        }
                        warn!(%err, ?delay, "transport dial failed, backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                            _ = shared.closed.cancelled() => return Err(PoolError::Closed),
                        }
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            // Pass 3: wait for a slot.
            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = shared.closed.cancelled() => return Err(PoolError::Closed),
                _ = shared.notify.notified() => {}
            }
        }
    }

    /// Return a checkout, reporting whether the transport behaved. A
    /// not-ok return marks it suspect; the second consecutive suspect
    /// condemns it.
    pub async fn checkin(&self, guard: PooledTransport<F>, ok: bool) {
        if guard.take_returned() {
            return;
        }
        let tracked = guard.tracked.clone();
        let outcome = tracked.release(ok);
        if outcome.invalidated {
            warn!(id = tracked.id, "transport condemned after repeated suspects");
        }
        if outcome.closeable {
            self.shared.remove_member(tracked.id);
            tracked.transport.close().await;
        }
        self.shared.notify_slot();
    }

    /// One probe pass: keepalive every non-busy transport, close drained
    /// invalid ones, prune long-idle members down to the warm-up floor.
    pub async fn probe(&self) {
        probe_once(&self.shared).await;
    }

    /// Condemn everything, wait for in-flight checkouts to drain (up to
    /// `drain_deadline`), then close all transports and stop the prober.
    pub async fn shutdown(&self, drain_deadline: Duration) {
        self.shared.closed.cancel();

        for tracked in self.shared.snapshot_members() {
            tracked.mark_invalid();
        }
        self.shared.notify.notify_waiters();

        let drained = tokio::time::timeout(drain_deadline, async {
            loop {
                let busy = self
                    .shared
                    .snapshot_members()
                    .iter()
                    .any(|t| t.snapshot().use_count > 0);
                if !busy {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("pool shutdown proceeding with undrained transports");
        }

        for tracked in self.shared.snapshot_members() {
            self.shared.remove_member(tracked.id);
            tracked.transport.close().await;
        }

        let prober = self
            .prober
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = prober {
            let _ = handle.await;
        }
        info!("connection pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let members = self.shared.snapshot_members();
        let mut use_counts = Vec::new();
        let mut draining = 0;
        for tracked in &members {
            let snap = tracked.snapshot();
            if snap.invalid {
                draining += 1;
            } else {
                use_counts.push(snap.use_count);
            }
        }
        use_counts.sort_unstable();
        PoolStats {
            transports: use_counts.len(),
            use_counts,
            draining,
        }
    }
}

async fn warmup_one<F: TransportFactory>(
    shared: Arc<Shared<F>>,
    cancel: CancellationToken,
    slot: usize,
) {
    let mut backoff = Backoff::new(shared.dial_backoff.clone());
    loop {
        if cancel.is_cancelled() || shared.closed.is_cancelled() {
            return;
        }
        match shared.factory.open(&cancel).await {
            Ok(transport) => {
                let tracked = shared.admit(transport);
                debug!(id = tracked.id, slot, "warm-up transport ready");
                shared.notify.notify_one();
                return;
            }
            Err(err) => {
                if !err.is_retryable() || backoff.exhausted() {
                    warn!(slot, %err, "warm-up attempt giving up");
                    return;
                }
                let delay = backoff.next_delay();
                debug!(slot, %err, ?delay, "warm-up dial failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                    _ = shared.closed.cancelled() => return,
                }
            }
        }
    }
}

async fn probe_loop<F: TransportFactory>(shared: Arc<Shared<F>>) {
    loop {
        let period = jittered(shared.config.probe_interval, PROBE_JITTER);
        tokio::select! {
            _ = shared.closed.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        probe_once(&shared).await;
    }
}

async fn probe_once<F: TransportFactory>(shared: &Arc<Shared<F>>) {
    let members = shared.snapshot_members();
    let mut live = members
        .iter()
        .filter(|t| !t.snapshot().invalid)
        .count();

    for tracked in members {
        let snap = tracked.snapshot();

        if snap.invalid {
            if snap.use_count == 0 {
                shared.remove_member(tracked.id);
                tracked.transport.close().await;
                debug!(id = tracked.id, "drained invalid transport closed");
            }
            continue;
        }
        // Busy transports are exercised by their own traffic.
        if snap.use_count > 0 {
            continue;
        }

        if tracked.transport.is_closed() {
            tracked.mark_invalid();
            shared.remove_member(tracked.id);
            tracked.transport.close().await;
            live -= 1;
            continue;
        }

        // Prune long-idle members down to the warm-up floor.
        if snap.idle_for > shared.config.max_idle && live > shared.config.warmup {
            tracked.mark_invalid();
            shared.remove_member(tracked.id);
            tracked.transport.close().await;
            live -= 1;
            debug!(id = tracked.id, "idle transport pruned");
            continue;
        }

        match tokio::time::timeout(PROBE_TIMEOUT, tracked.transport.keepalive()).await {
            Ok(Ok(())) => tracked.record_probe(),
            Ok(Err(err)) => {
                warn!(id = tracked.id, %err, "keepalive failed, condemning transport");
                if tracked.mark_invalid() {
                    shared.remove_member(tracked.id);
                    tracked.transport.close().await;
                    live -= 1;
                }
            }
            Err(_) => {
                warn!(id = tracked.id, "keepalive timed out, condemning transport");
                if tracked.mark_invalid() {
                    shared.remove_member(tracked.id);
                    tracked.transport.close().await;
                    live -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use async_trait::async_trait;
    use porthole_ssh::{SshError, TunnelStream};

    #[derive(Clone)]
    struct FakeTransport {
        inner: Arc<FakeInner>,
    }

    struct FakeInner {
        closed: AtomicBool,
        keepalive_fail: AtomicBool,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                inner: Arc::new(FakeInner {
                    closed: AtomicBool::new(false),
                    keepalive_fail: AtomicBool::new(false),
                }),
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open_tunnel(&self, _host: &str, _port: u16) -> porthole_ssh::Result<TunnelStream> {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(SshError::TransportClosed);
            }
            let (client, _server) = tokio::io::duplex(64);
            Ok(Box::new(client))
        }

        async fn keepalive(&self) -> porthole_ssh::Result<()> {
            if self.inner.closed.load(Ordering::SeqCst)
                || self.inner.keepalive_fail.load(Ordering::SeqCst)
            {
                return Err(SshError::TransportClosed);
            }
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.inner.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.inner.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeFactoryInner {
        fail_first: AtomicUsize,
        fail_with_auth: AtomicBool,
        opened: Mutex<Vec<FakeTransport>>,
    }

    #[derive(Clone)]
    struct FakeFactory(Arc<FakeFactoryInner>);

    impl std::ops::Deref for FakeFactory {
        type Target = FakeFactoryInner;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl FakeFactory {
        fn new() -> Self {
            Self(Arc::new(FakeFactoryInner {
                fail_first: AtomicUsize::new(0),
                fail_with_auth: AtomicBool::new(false),
                opened: Mutex::new(Vec::new()),
            }))
        }

        fn failing(n: usize) -> Self {
            let f = Self::new();
            f.fail_first.store(n, Ordering::SeqCst);
            f
        }

        fn opened_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        fn transport(&self, index: usize) -> FakeTransport {
            self.opened.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        type Transport = FakeTransport;

        async fn open(&self, _cancel: &CancellationToken) -> porthole_ssh::Result<FakeTransport> {
            if self.fail_with_auth.load(Ordering::SeqCst) {
                return Err(SshError::AuthFailed("rejected".into()));
            }
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(SshError::NetUnreachable("synthetic".into()));
            }
            let transport = FakeTransport::new();
            self.opened.lock().unwrap().push(transport.clone());
            Ok(transport)
        }
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(5),
            multiplier: 2.0,
            max: Duration::from_millis(20),
            jitter: 0.0,
            max_attempts: 10,
        }
    }

    fn config(size: usize, warmup: usize, max_uses: usize) -> PoolConfig {
        PoolConfig {
            size,
            warmup,
            max_uses_per_conn: max_uses,
            probe_interval: Duration::from_secs(3600),
            max_idle: Duration::from_secs(3600),
            init_deadline: Duration::from_secs(2),
        }
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    async fn wait_for<P: Fn() -> bool>(pred: P) {
        for _ in 0..200 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_warmup_reaches_configured_count() {
        let factory = FakeFactory::new();
        let pool = ConnectionPool::init(factory.clone(), config(4, 2, 8), fast_backoff(), &token())
            .await
            .unwrap();

        wait_for(|| factory.opened_count() == 2).await;
        assert_eq!(pool.stats().transports, 2);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_init_tolerates_partial_warmup_failure() {
        // First dial fails; the retry succeeds within the deadline.
        let factory = FakeFactory::failing(1);
        let pool = ConnectionPool::init(factory.clone(), config(4, 2, 8), fast_backoff(), &token())
            .await
            .unwrap();
        assert!(pool.stats().transports >= 1);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_init_fails_when_nothing_dials() {
        let factory = FakeFactory::failing(1000);
        let mut cfg = config(4, 2, 8);
        cfg.init_deadline = Duration::from_millis(100);
        let err = ConnectionPool::init(factory, cfg, fast_backoff(), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::InitTimeout));
    }

    #[tokio::test]
    async fn test_six_checkouts_saturate_two_transports() {
        let factory = FakeFactory::new();
        let pool = Arc::new(
            ConnectionPool::init(factory.clone(), config(2, 2, 3), fast_backoff(), &token())
                .await
                .unwrap(),
        );
        wait_for(|| factory.opened_count() == 2).await;

        let mut guards = Vec::new();
        for _ in 0..6 {
            guards.push(pool.checkout(&token()).await.unwrap());
        }
        assert_eq!(pool.stats().use_counts, vec![3, 3]);
        assert_eq!(factory.opened_count(), 2, "cap must hold at size=2");

        // The seventh blocks...
        let seventh = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout(&token()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!seventh.is_finished());

        // ...until a check-in frees a slot.
        pool.checkin(guards.pop().unwrap(), true).await;
        let guard = tokio::time::timeout(Duration::from_secs(1), seventh)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(pool.stats().use_counts, vec![3, 3]);
        drop(guard);
        drop(guards);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_checkout_prefers_lowest_use_count() {
        let factory = FakeFactory::new();
        let pool = ConnectionPool::init(factory.clone(), config(2, 2, 8), fast_backoff(), &token())
            .await
            .unwrap();
        wait_for(|| factory.opened_count() == 2).await;

        let _a = pool.checkout(&token()).await.unwrap();
        let _b = pool.checkout(&token()).await.unwrap();
        // Two checkouts spread across the two warm transports.
        assert_eq!(pool.stats().use_counts, vec![1, 1]);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_consecutive_suspects_replace_transport() {
        let factory = FakeFactory::new();
        let pool = ConnectionPool::init(factory.clone(), config(2, 1, 8), fast_backoff(), &token())
            .await
            .unwrap();
        wait_for(|| factory.opened_count() == 1).await;

        let g1 = pool.checkout(&token()).await.unwrap();
        pool.checkin(g1, false).await;
        let g2 = pool.checkout(&token()).await.unwrap();
        pool.checkin(g2, false).await;

        // The condemned transport was drained, so it closed immediately.
        assert!(factory.transport(0).is_closed());
        assert_eq!(pool.stats().transports, 0);

        // The next checkout dials a replacement.
        let g3 = pool.checkout(&token()).await.unwrap();
        assert_eq!(factory.opened_count(), 2);
        pool.checkin(g3, true).await;
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_probe_condemns_failing_keepalive() {
        let factory = FakeFactory::new();
        let pool = ConnectionPool::init(factory.clone(), config(2, 2, 8), fast_backoff(), &token())
            .await
            .unwrap();
        wait_for(|| factory.opened_count() == 2).await;

        factory
            .transport(0)
            .inner
            .keepalive_fail
            .store(true, Ordering::SeqCst);
        pool.probe().await;

        assert_eq!(pool.stats().transports, 1);
        assert!(factory.transport(0).is_closed());
        assert!(!factory.transport(1).is_closed());
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_probe_prunes_idle_down_to_warmup() {
        let factory = FakeFactory::new();
        let mut cfg = config(3, 1, 1);
        cfg.max_idle = Duration::ZERO;
        let pool = ConnectionPool::init(factory.clone(), cfg, fast_backoff(), &token())
            .await
            .unwrap();
        wait_for(|| factory.opened_count() == 1).await;

        // Force two more transports open via saturating checkouts.
        let a = pool.checkout(&token()).await.unwrap();
        let b = pool.checkout(&token()).await.unwrap();
        let c = pool.checkout(&token()).await.unwrap();
        assert_eq!(pool.stats().transports, 3);
        pool.checkin(a, true).await;
        pool.checkin(b, true).await;
        pool.checkin(c, true).await;

        pool.probe().await;
        assert_eq!(
            pool.stats().transports,
            1,
            "idle members prune down to warmup"
        );
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_nonretryable_dial_fails_checkout() {
        let factory = FakeFactory::new();
        factory.fail_with_auth.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::init(
            factory.clone(),
            config(1, 0, 8),
            fast_backoff(),
            &token(),
        )
        .await
        .unwrap();

        let err = pool.checkout(&token()).await.unwrap_err();
        assert!(matches!(err, PoolError::Dial(SshError::AuthFailed(_))));
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_checkout_honors_cancellation() {
        let factory = FakeFactory::new();
        let pool = Arc::new(
            ConnectionPool::init(factory.clone(), config(1, 1, 1), fast_backoff(), &token())
                .await
                .unwrap(),
        );
        wait_for(|| factory.opened_count() == 1).await;

        let _held = pool.checkout(&token()).await.unwrap();

        let cancel = token();
        let blocked = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.checkout(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PoolError::Cancelled)));
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything_and_rejects_checkouts() {
        let factory = FakeFactory::new();
        let pool = ConnectionPool::init(factory.clone(), config(3, 2, 8), fast_backoff(), &token())
            .await
            .unwrap();
        wait_for(|| factory.opened_count() == 2).await;

        let guard = pool.checkout(&token()).await.unwrap();
        // Return it shortly after shutdown begins, inside the drain window.
        let returner = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        pool.shutdown(Duration::from_secs(2)).await;
        returner.await.unwrap();

        for i in 0..factory.opened_count() {
            assert!(factory.transport(i).is_closed(), "transport {i} left open");
        }
        let err = pool.checkout(&token()).await.unwrap_err();
        assert!(matches!(err, PoolError::Closed));
    }

    #[tokio::test]
    async fn test_drop_returns_checkout() {
        let factory = FakeFactory::new();
        let pool = ConnectionPool::init(factory.clone(), config(1, 1, 2), fast_backoff(), &token())
            .await
            .unwrap();
        wait_for(|| factory.opened_count() == 1).await;

        {
            let _guard = pool.checkout(&token()).await.unwrap();
            assert_eq!(pool.stats().use_counts, vec![1]);
        }
        assert_eq!(pool.stats().use_counts, vec![0]);
        pool.shutdown(Duration::from_secs(1)).await;
    }
}
