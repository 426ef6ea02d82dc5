use anyhow::Result;
use chrono::Utc;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

use super::storage::{MemoryTokenStorage, TokenStorage};
use super::types::{AccessToken, PersistedSession, RefreshToken, TokenPair};

#[derive(Debug, Default)]
struct SessionState {
    tokens: Option<TokenPair>,
    session_expired: bool,
}

/// Token store
/// Single source of truth for the current token pair and the session-expired flag.
///
/// Every mutation is persisted to the configured [`TokenStorage`] while the
/// write lock is held, so the durable copy never reorders relative to memory.
/// Locks are never held across an `.await`.
pub struct TokenStore {
    state: RwLock<SessionState>,
    storage: Arc<dyn TokenStorage>,
    expired_tx: watch::Sender<bool>,
}

impl TokenStore {
    /// Create a store backed by `storage`, restoring any saved session
    pub fn open(storage: Arc<dyn TokenStorage>) -> Result<Self> {
        let state = match storage.load()? {
            Some(saved) => {
                tracing::debug!(
                    updated_at = %saved.updated_at.to_rfc3339(),
                    session_expired = saved.session_expired,
                    "Restored saved session"
                );
                SessionState {
                    tokens: saved.tokens(),
                    session_expired: saved.session_expired,
                }
            }
            None => SessionState::default(),
        };

        let (expired_tx, _) = watch::channel(state.session_expired);

        Ok(Self {
            state: RwLock::new(state),
            storage,
            expired_tx,
        })
    }

    /// Create an empty store that lives only in memory
    pub fn in_memory() -> Self {
        let (expired_tx, _) = watch::channel(false);
        Self {
            state: RwLock::new(SessionState::default()),
            storage: Arc::new(MemoryTokenStorage::new()),
            expired_tx,
        }
    }

    pub fn access_token(&self) -> Option<AccessToken> {
        self.read().tokens.as_ref().map(|t| t.access.clone())
    }

    pub fn refresh_token(&self) -> Option<RefreshToken> {
        self.read().tokens.as_ref().map(|t| t.refresh.clone())
    }

    /// Consistent snapshot of both tokens
    pub fn tokens(&self) -> Option<TokenPair> {
        self.read().tokens.clone()
    }

    /// Replace both tokens at once; a fresh pair also ends any expired session
    pub fn set_tokens(&self, pair: TokenPair) {
        let mut state = self.write();
        self.install(&mut state, pair);
    }

    /// Replace the pair only if the store still holds `expected`
    ///
    /// Returns `false`, leaving the store untouched, when a login, logout or
    /// another refresh has replaced the session in the meantime.
    pub fn set_tokens_if(&self, expected: &TokenPair, pair: TokenPair) -> bool {
        let mut state = self.write();
        if state.tokens.as_ref() != Some(expected) {
            return false;
        }
        self.install(&mut state, pair);
        true
    }

    /// Drop both tokens and flag the session as expired
    pub fn clear(&self) {
        let mut state = self.write();
        self.expire(&mut state);
    }

    /// Clear only while `still_current` accepts the stored pair
    pub fn clear_if(&self, still_current: impl FnOnce(Option<&TokenPair>) -> bool) -> bool {
        let mut state = self.write();
        if !still_current(state.tokens.as_ref()) {
            return false;
        }
        self.expire(&mut state);
        true
    }

    /// Explicit logout: drop both tokens without flagging expiry
    pub fn sign_out(&self) {
        let mut state = self.write();
        state.tokens = None;
        state.session_expired = false;
        self.persist(&state);
        self.expired_tx.send_replace(false);
        tracing::info!("Signed out");
    }

    pub fn is_session_expired(&self) -> bool {
        self.read().session_expired
    }

    /// Clear the expired flag without restoring tokens
    pub fn acknowledge_session_expired(&self) {
        let mut state = self.write();
        if !state.session_expired {
            return;
        }
        state.session_expired = false;
        self.persist(&state);
        self.expired_tx.send_replace(false);
    }

    /// Watch the session-expired flag
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.expired_tx.subscribe()
    }

    fn install(&self, state: &mut SessionState, pair: TokenPair) {
        state.tokens = Some(pair);
        state.session_expired = false;
        self.persist(state);
        self.expired_tx.send_replace(false);
    }

    fn expire(&self, state: &mut SessionState) {
        state.tokens = None;
        state.session_expired = true;
        self.persist(state);
        self.expired_tx.send_replace(true);
        tracing::warn!("Session expired, tokens cleared");
    }

    // Runs under the write lock so saves land in mutation order. The write is
    // one small local row; callers on the runtime accept that blocking.
    fn persist(&self, state: &SessionState) {
        let session = PersistedSession {
            access_token: state.tokens.as_ref().map(|t| t.access.clone()),
            refresh_token: state.tokens.as_ref().map(|t| t.refresh.clone()),
            session_expired: state.session_expired,
            updated_at: Utc::now(),
        };

        if let Err(e) = self.storage.save(&session) {
            tracing::warn!(error = %e, "Failed to persist session; continuing in memory");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}
