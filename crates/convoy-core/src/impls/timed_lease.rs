//! TimedLeaseProvider - a liveness lease that lapses on its own.
//!
//! Stands in for a platform wake lock. Each lease has a deadline pushed out by
//! `renew`; when running inside a tokio runtime a watchdog logs the moment a
//! lease lapses without being renewed or released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ports::{Lease, LeaseProvider};

pub struct TimedLeaseProvider {
    timeout: Duration,
    next_id: AtomicU64,
}

impl TimedLeaseProvider {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_id: AtomicU64::new(1),
        }
    }
}

struct LeaseState {
    id: u64,
    timeout: Duration,
    deadline: Mutex<Instant>,
    released: AtomicBool,
}

impl LeaseState {
    fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct TimedLease {
    state: Arc<LeaseState>,
    watchdog: Option<AbortHandle>,
}

impl LeaseProvider for TimedLeaseProvider {
    fn acquire(&self, why: &str) -> Box<dyn Lease> {
        let state = Arc::new(LeaseState {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timeout: self.timeout,
            deadline: Mutex::new(Instant::now() + self.timeout),
            released: AtomicBool::new(false),
        });
        debug!(lease = state.id, why, "lease acquired");
        let watchdog = Handle::try_current()
            .ok()
            .map(|handle| handle.spawn(watch_expiry(Arc::clone(&state))).abort_handle());
        Box::new(TimedLease { state, watchdog })
    }
}

async fn watch_expiry(state: Arc<LeaseState>) {
    loop {
        tokio::time::sleep_until(state.deadline()).await;
        if state.released.load(Ordering::Acquire) {
            return;
        }
        if Instant::now() >= state.deadline() {
            warn!(
                lease = state.id,
                timeout_ms = state.timeout.as_millis() as u64,
                "liveness lease expired"
            );
            return;
        }
    }
}

impl Lease for TimedLease {
    fn renew(&self, why: &str) {
        let mut deadline = self.state.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        *deadline = Instant::now() + self.state.timeout;
        debug!(lease = self.state.id, why, "lease renewed");
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.state.deadline()
    }

    fn release(self: Box<Self>, why: &str) {
        self.state.released.store(true, Ordering::Release);
        if let Some(watchdog) = &self.watchdog {
            watchdog.abort();
        }
        debug!(lease = self.state.id, why, "lease released");
    }
}
