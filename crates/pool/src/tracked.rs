use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use porthole_ssh::{Transport, TransportFactory, TunnelStream};

use crate::pool::Shared;
use crate::Result;

/// Consecutive suspect check-ins before a transport is condemned.
pub(crate) const SUSPECT_LIMIT: u32 = 2;

#[derive(Debug, Clone, Copy)]
pub(crate) struct TrackedSnapshot {
    pub use_count: usize,
    pub invalid: bool,
    pub idle_for: std::time::Duration,
}

struct TrackedState {
    use_count: usize,
    invalid: bool,
    suspect_count: u32,
    last_used_at: Instant,
    last_probe_at: Instant,
}

pub(crate) struct ReleaseOutcome {
    pub closeable: bool,
    pub invalidated: bool,
}

/// Pool bookkeeping around one transport.
///
/// The counters live behind their own mutex; the pool's table lock is never
/// held while a transport's state lock is taken, and vice versa.
pub(crate) struct Tracked<T: Transport> {
    pub(crate) id: u64,
    pub(crate) transport: T,
    pub(crate) created_at: Instant,
    state: Mutex<TrackedState>,
}

impl<T: Transport> Tracked<T> {
    pub(crate) fn new(id: u64, transport: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            transport,
            created_at: now,
            state: Mutex::new(TrackedState {
                use_count: 0,
                invalid: false,
                suspect_count: 0,
                last_used_at: now,
                last_probe_at: now,
            }),
        }
    }

    /// Claim one use slot. Fails when invalid or at the cap.
    pub(crate) fn try_acquire(&self, max_uses: usize) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.invalid || state.use_count >= max_uses {
            return false;
        }
        state.use_count += 1;
        state.last_used_at = Instant::now();
        true
    }

    /// Return one use slot. A not-ok return counts toward suspicion; two in
    /// a row invalidate the transport.
    pub(crate) fn release(&self, ok: bool) -> ReleaseOutcome {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.use_count = state.use_count.saturating_sub(1);
        state.last_used_at = Instant::now();

        let mut invalidated = false;
        if ok {
            state.suspect_count = 0;
        } else {
            state.suspect_count += 1;
            if state.suspect_count >= SUSPECT_LIMIT && !state.invalid {
                state.invalid = true;
                invalidated = true;
            }
        }

        ReleaseOutcome {
            closeable: state.invalid && state.use_count == 0,
            invalidated,
        }
    }

    /// Condemn the transport. Returns true when it can be closed right now
    /// (no checkouts in flight).
    pub(crate) fn mark_invalid(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.invalid = true;
        state.use_count == 0
    }

    pub(crate) fn record_probe(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_probe_at = Instant::now();
    }

    pub(crate) fn snapshot(&self) -> TrackedSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        TrackedSnapshot {
            use_count: state.use_count,
            invalid: state.invalid,
            idle_for: state.last_used_at.elapsed(),
        }
    }
}

/// A checked-out transport.
///
/// Dropping the guard checks the transport back in as healthy; the explicit
/// [`ConnectionPool::checkin`](crate::ConnectionPool::checkin) path is for
/// callers that want to report a failure. The guard exposes only channel
/// opening — never the pool's table.
pub struct PooledTransport<F: TransportFactory> {
    pub(crate) tracked: Arc<Tracked<F::Transport>>,
    pub(crate) shared: Arc<Shared<F>>,
    pub(crate) returned: AtomicBool,
}

impl<F: TransportFactory> std::fmt::Debug for PooledTransport<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledTransport")
            .field("id", &self.tracked.id)
            .finish()
    }
}

impl<F: TransportFactory> PooledTransport<F> {
    pub(crate) fn new(tracked: Arc<Tracked<F::Transport>>, shared: Arc<Shared<F>>) -> Self {
        Self {
            tracked,
            shared,
            returned: AtomicBool::new(false),
        }
    }

    /// Open a forward channel through the checked-out transport.
    pub async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream> {
        Ok(self.tracked.transport.open_tunnel(host, port).await?)
    }

    pub fn transport(&self) -> &F::Transport {
        &self.tracked.transport
    }

    pub(crate) fn take_returned(&self) -> bool {
        self.returned.swap(true, Ordering::SeqCst)
    }
}

impl<F: TransportFactory> Drop for PooledTransport<F> {
    fn drop(&mut self) {
        if !self.take_returned() {
            // Implicit healthy check-in; closing of drained invalid
            // transports happens on the next probe pass.
            self.tracked.release(true);
            self.shared.notify_slot();
        }
    }
}
