// Error handling module
// Classified errors surfaced to callers of the authenticated client

use thiserror::Error;

use crate::transport::TransportError;

/// Why a session refresh did not produce a new token
///
/// Cloneable so a single outcome can be handed to every parked waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// No refresh token stored; nothing was sent
    #[error("no refresh token available")]
    MissingRefreshToken,

    /// Refresh endpoint answered with a non-success status
    #[error("refresh endpoint rejected the token: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Refresh call never got a response
    #[error("refresh request failed: {0}")]
    Transport(#[from] TransportError),

    /// Refresh endpoint answered 2xx with an unusable body
    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    /// Refresh task ended without settling normally
    #[error("refresh aborted: {0}")]
    Aborted(String),
}

/// Why an unauthorized response could not be recovered
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnauthorizedCause {
    /// The single replay with a fresh token was rejected too
    #[error("request rejected after token refresh")]
    ReplayRejected,

    /// The refresh itself failed
    #[error("token refresh failed: {0}")]
    Refresh(#[from] RefreshError),
}

/// Errors returned by [`crate::http_client::AuthHttpClient`]
#[derive(Error, Debug)]
pub enum ApiError {
    /// Server answered 429; never triggers a refresh
    #[error("Rate limited: {message}")]
    RateLimited {
        retry_after: Option<u64>,
        message: String,
    },

    /// Session could not be recovered; the session-expired flag is set
    #[error("Unauthorized: {0}")]
    Unauthorized(UnauthorizedCause),

    /// Any other error status, passed through untouched
    #[error("API error: {status} - {message}")]
    Status { status: u16, message: String },

    /// Network failure before a response arrived
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Response body could not be decoded
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Coarse classification used by callers and UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimited,
    UnauthorizedTerminal,
    NetworkOrServer,
    /// Failure on this side before or after the exchange
    Local,
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            ApiError::Unauthorized(_) => ErrorKind::UnauthorizedTerminal,
            ApiError::Status { .. } | ApiError::Transport(_) => ErrorKind::NetworkOrServer,
            ApiError::InvalidRequest(_) | ApiError::Decode(_) => ErrorKind::Local,
        }
    }

    /// Whether the user has to sign in again
    pub fn requires_login(&self) -> bool {
        self.kind() == ErrorKind::UnauthorizedTerminal
    }

    /// HTTP status behind this error, if one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::RateLimited { .. } => Some(429),
            ApiError::Unauthorized(UnauthorizedCause::ReplayRejected) => Some(401),
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<RefreshError> for ApiError {
    fn from(e: RefreshError) -> Self {
        ApiError::Unauthorized(UnauthorizedCause::Refresh(e))
    }
}
