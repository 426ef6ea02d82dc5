use anyhow::Result as AnyResult;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::auth::{HttpRefresher, RefreshCoordinator, Refresher, TokenPair, TokenStore};
use crate::config::Config;
use crate::error::{ApiError, UnauthorizedCause};
use crate::request::{resolve_url, ApiRequest, ApiResponse, RequestAttempt};
use crate::retry;
use crate::transport::{ReqwestTransport, Transport};

/// What to do with a received response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Hand the response to the caller
    Deliver,
    /// 429: reject at once, never refresh
    RateLimited,
    /// First 401 on this attempt: refresh, then replay once
    RefreshAndReplay,
    /// 401 on an attempt that was already replayed
    RejectUnauthorized,
    /// Any other error status
    Reject,
}

/// Classify a response status for an attempt
pub fn classify(status: StatusCode, retried: bool) -> Disposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Disposition::RateLimited,
        StatusCode::UNAUTHORIZED if retried => Disposition::RejectUnauthorized,
        StatusCode::UNAUTHORIZED => Disposition::RefreshAndReplay,
        s if s.is_client_error() || s.is_server_error() => Disposition::Reject,
        _ => Disposition::Deliver,
    }
}

/// Authenticated API client
/// Attaches the session token to every request and transparently recovers
/// from an expired access token:
/// - 401: refreshes through the shared coordinator and replays once
/// - 429: surfaced immediately
/// - other errors: surfaced unchanged
pub struct AuthHttpClient {
    base_url: Url,
    transport: Arc<dyn Transport>,
    store: Arc<TokenStore>,
    coordinator: RefreshCoordinator,
}

impl AuthHttpClient {
    pub fn new(
        base_url: Url,
        transport: Arc<dyn Transport>,
        store: Arc<TokenStore>,
        refresher: Arc<dyn Refresher>,
    ) -> Self {
        let coordinator = RefreshCoordinator::new(store.clone(), refresher);
        Self {
            base_url,
            transport,
            store,
            coordinator,
        }
    }

    /// Build a client with a pooled `reqwest` transport and the configured
    /// refresh endpoint
    pub fn from_config(config: &Config, store: Arc<TokenStore>) -> AnyResult<Self> {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(
            config.http_max_connections,
            config.http_connect_timeout,
            config.http_request_timeout,
        )?);
        let refresher = Arc::new(HttpRefresher::new(transport.clone(), config.refresh_url()?));

        Ok(Self::new(
            config.api_base_url.clone(),
            transport,
            store,
            refresher,
        ))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Start a session with tokens from the login flow
    pub fn login(&self, tokens: TokenPair) {
        self.store.set_tokens(tokens);
    }

    pub fn logout(&self) {
        self.store.sign_out();
    }

    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        resolve_url(&self.base_url, path)
    }

    /// Request for `path` relative to the base URL
    pub fn request(&self, method: Method, path: &str) -> Result<ApiRequest, ApiError> {
        Ok(ApiRequest::new(method, self.url(path)?))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(self.request(Method::GET, path)?).await?;
        Ok(response.json()?)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self
            .request(Method::POST, path)?
            .json(body)
            .map_err(|e| ApiError::InvalidRequest(format!("failed to encode body: {}", e)))?;
        let response = self.send(request).await?;
        Ok(response.json()?)
    }

    /// Send a new logical request
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.send_attempt(RequestAttempt::new(request)).await
    }

    /// Send a caller-tagged attempt; an attempt already marked as retried
    /// never enters the refresh path
    pub async fn send_attempt(&self, attempt: RequestAttempt) -> Result<ApiResponse, ApiError> {
        let attempt = attempt.authorized(self.store.access_token())?;
        let response = self.dispatch(&attempt).await?;

        let disposition = classify(response.status(), attempt.is_retried());
        if disposition != Disposition::RefreshAndReplay {
            return self.conclude(disposition, &attempt, response);
        }

        tracing::warn!(
            attempt_id = %attempt.id(),
            url = %attempt.request().url(),
            "Received 401, refreshing session token..."
        );

        let token = self
            .coordinator
            .refresh(attempt.credential())
            .await
            .map_err(|e| {
                tracing::error!(
                    attempt_id = %attempt.id(),
                    error = %e,
                    "Session refresh failed"
                );
                ApiError::from(e)
            })?;

        let replay = retry::replay(&attempt, &token)?;
        let response = self.dispatch(&replay).await?;
        let disposition = classify(response.status(), replay.is_retried());
        self.conclude(disposition, &replay, response)
    }

    async fn dispatch(&self, attempt: &RequestAttempt) -> Result<ApiResponse, ApiError> {
        let request = attempt.request();
        tracing::debug!(
            attempt_id = %attempt.id(),
            method = %request.method(),
            url = %request.url(),
            retried = attempt.is_retried(),
            authenticated = attempt.credential().is_some(),
            "Sending HTTP request"
        );

        let response = self.transport.send(request.clone()).await?;

        tracing::debug!(
            attempt_id = %attempt.id(),
            status = %response.status(),
            "Received HTTP response"
        );
        Ok(response)
    }

    /// Turn a final response into the caller's result. Never refreshes.
    fn conclude(
        &self,
        disposition: Disposition,
        attempt: &RequestAttempt,
        response: ApiResponse,
    ) -> Result<ApiResponse, ApiError> {
        let status = response.status();
        match disposition {
            Disposition::Deliver => Ok(response),
            Disposition::RateLimited => {
                let retry_after = response.retry_after();
                tracing::warn!(
                    attempt_id = %attempt.id(),
                    url = %attempt.request().url(),
                    retry_after = ?retry_after,
                    "Rate limited"
                );
                Err(ApiError::RateLimited {
                    retry_after,
                    message: response.text(),
                })
            }
            Disposition::RefreshAndReplay | Disposition::RejectUnauthorized => {
                // A rejection of a credential the store no longer holds says
                // nothing about the current session
                let expired = self
                    .store
                    .clear_if(|t| t.map(|p| &p.access) == attempt.credential());
                tracing::warn!(
                    attempt_id = %attempt.id(),
                    url = %attempt.request().url(),
                    session_expired = expired,
                    "Request rejected after token refresh"
                );
                Err(ApiError::Unauthorized(UnauthorizedCause::ReplayRejected))
            }
            Disposition::Reject => {
                let error_text = response.text();
                tracing::debug!(
                    attempt_id = %attempt.id(),
                    status = status.as_u16(),
                    url = %attempt.request().url(),
                    response_body = %error_text,
                    "HTTP request failed with error response"
                );
                Err(ApiError::Status {
                    status: status.as_u16(),
                    message: error_text,
                })
            }
        }
    }
}
