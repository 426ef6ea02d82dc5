// Pickup client - authenticated API access with single-flight token refresh

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod request;
pub mod retry;
pub mod transport;

pub use auth::{AccessToken, RefreshToken, TokenPair, TokenStore};
pub use error::{ApiError, ErrorKind, RefreshError, UnauthorizedCause};
pub use http_client::AuthHttpClient;
pub use request::{ApiRequest, ApiResponse, RequestAttempt};
