// Single-flight session refresh

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use super::refresh::Refresher;
use super::store::TokenStore;
use super::types::{AccessToken, TokenPair};
use crate::error::RefreshError;

/// Outcome handed to every caller of one refresh cycle
pub type RefreshOutcome = Result<AccessToken, RefreshError>;

type Waiter = oneshot::Sender<RefreshOutcome>;

enum Phase {
    Idle,
    /// Waiters in registration order; the driver is always first
    Refreshing { waiters: Vec<Waiter> },
}

enum Entry {
    Settled(RefreshOutcome),
    Parked(oneshot::Receiver<RefreshOutcome>),
}

struct Shared {
    phase: Mutex<Phase>,
    store: Arc<TokenStore>,
    refresher: Arc<dyn Refresher>,
    completed_cycles: AtomicU64,
}

/// Refresh coordinator
/// Guarantees at most one refresh call in flight per token store.
///
/// The first caller that needs a refresh while `Idle` starts the cycle and the
/// refresh call runs on its own task; every caller, the starter included,
/// parks on a waiter until that call settles. Dropping a caller never cancels
/// the shared call. Settling updates (or clears) the store and returns the
/// coordinator to `Idle` under the same lock, then releases waiters FIFO.
/// A result is only applied while the store still holds the pair the cycle
/// started from.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<TokenStore>, refresher: Arc<dyn Refresher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Idle),
                store,
                refresher,
                completed_cycles: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.shared.store
    }

    /// Obtain an access token to replace `stale`, the credential a request
    /// was rejected with
    ///
    /// Joins the in-flight cycle if there is one. When idle and the store
    /// already holds a different token than `stale`, that token is returned
    /// without a new cycle. Without a refresh token this fails immediately,
    /// with no network call, and marks the session expired.
    pub async fn refresh(&self, stale: Option<&AccessToken>) -> RefreshOutcome {
        match self.enter(stale) {
            Entry::Settled(outcome) => outcome,
            Entry::Parked(rx) => rx.await.unwrap_or_else(|_| {
                Err(RefreshError::Aborted(
                    "refresh task dropped without settling".to_string(),
                ))
            }),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.shared.lock_phase(), Phase::Refreshing { .. })
    }

    /// Callers parked on the current cycle, the driver included
    pub fn pending_waiters(&self) -> usize {
        match &*self.shared.lock_phase() {
            Phase::Idle => 0,
            Phase::Refreshing { waiters } => waiters.len(),
        }
    }

    /// Number of refresh cycles that have settled
    pub fn completed_cycles(&self) -> u64 {
        self.shared.completed_cycles.load(Ordering::Relaxed)
    }

    fn enter(&self, stale: Option<&AccessToken>) -> Entry {
        let mut phase = self.shared.lock_phase();

        if let Phase::Refreshing { waiters } = &mut *phase {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            tracing::debug!(waiters = waiters.len(), "Refresh in flight, parking caller");
            return Entry::Parked(rx);
        }

        let Some(started) = self.shared.store.tokens() else {
            if self.shared.store.clear_if(|t| t.is_none()) {
                tracing::warn!("No refresh token available, session expired");
                return Entry::Settled(Err(RefreshError::MissingRefreshToken));
            }
            // Signed in between the snapshot and the check
            return Entry::Settled(self.shared.current_session());
        };

        if stale != Some(&started.access) {
            tracing::debug!("Token already replaced since request was sent");
            return Entry::Settled(Ok(started.access));
        }

        let (tx, rx) = oneshot::channel();
        *phase = Phase::Refreshing { waiters: vec![tx] };
        drop(phase);

        let cycle = Cycle {
            shared: Arc::clone(&self.shared),
            started,
            settled: false,
        };
        tokio::spawn(cycle.run());

        Entry::Parked(rx)
    }
}

/// One refresh call, started from the pair the store held when it began
///
/// Owned by the spawned task. If the task is dropped before the call settles
/// (runtime shutdown), the cycle is abandoned so the coordinator still
/// returns to `Idle`.
struct Cycle {
    shared: Arc<Shared>,
    started: TokenPair,
    settled: bool,
}

impl Cycle {
    async fn run(mut self) {
        let result = AssertUnwindSafe(self.shared.refresher.refresh(&self.started.refresh))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(RefreshError::Aborted("refresher panicked".to_string())));

        self.shared.settle(&self.started, result);
        self.settled = true;
    }
}

impl Drop for Cycle {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Refresh task dropped before settling");
            self.shared.abandon();
        }
    }
}

impl Shared {
    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply the result only if the store still holds `started`; a login or
    /// logout that landed mid-flight wins over the refresh
    fn settle(&self, started: &TokenPair, result: Result<TokenPair, RefreshError>) {
        let (outcome, waiters) = {
            let mut phase = self.lock_phase();

            let outcome = match result {
                Ok(pair) => {
                    let access = pair.access.clone();
                    if self.store.set_tokens_if(started, pair) {
                        Ok(access)
                    } else {
                        self.superseded()
                    }
                }
                Err(e) => {
                    if self.store.clear_if(|t| t == Some(started)) {
                        tracing::error!(error = %e, "Session refresh failed, clearing tokens");
                        Err(e)
                    } else {
                        self.superseded()
                    }
                }
            };

            (outcome, Self::finish(&mut phase))
        };

        self.completed_cycles.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            waiters = waiters.len(),
            success = outcome.is_ok(),
            "Refresh cycle settled"
        );

        for waiter in waiters {
            // Receiver gone means the caller lost interest
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Return to `Idle` without touching the store
    fn abandon(&self) {
        let waiters = Self::finish(&mut self.lock_phase());
        let outcome: RefreshOutcome = Err(RefreshError::Aborted(
            "refresh task dropped without settling".to_string(),
        ));
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn superseded(&self) -> RefreshOutcome {
        tracing::info!("Session changed while refreshing, keeping the current session");
        self.current_session()
    }

    fn current_session(&self) -> RefreshOutcome {
        self.store
            .access_token()
            .ok_or_else(|| RefreshError::Aborted("session ended while refreshing".to_string()))
    }

    fn finish(phase: &mut Phase) -> Vec<Waiter> {
        match std::mem::replace(phase, Phase::Idle) {
            Phase::Refreshing { waiters } => waiters,
            Phase::Idle => Vec::new(),
        }
    }
}
