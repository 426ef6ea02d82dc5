// Session refresh endpoint call

use async_trait::async_trait;
use reqwest::Url;
use std::sync::Arc;

use super::types::{AccessToken, RefreshRequest, RefreshResponse, RefreshToken, TokenPair};
use crate::error::RefreshError;
use crate::request::ApiRequest;
use crate::transport::Transport;

/// Exchanges a refresh token for a new token pair
#[async_trait]
pub trait Refresher: Send + Sync {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenPair, RefreshError>;
}

/// Calls the JSON refresh endpoint directly on the transport
///
/// The call bypasses the intercepting client, so a 401 from the refresh
/// endpoint is a plain refresh failure and can never recurse.
pub struct HttpRefresher {
    transport: Arc<dyn Transport>,
    url: Url,
}

impl HttpRefresher {
    pub fn new(transport: Arc<dyn Transport>, url: Url) -> Self {
        Self { transport, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Refresher for HttpRefresher {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenPair, RefreshError> {
        tracing::info!(url = %self.url, "Refreshing session token...");

        let body = RefreshRequest {
            refresh_token: refresh_token.as_str(),
        };
        let request = ApiRequest::post(self.url.clone())
            .json(&body)
            .map_err(|e| RefreshError::Aborted(format!("failed to encode refresh request: {}", e)))?;

        let response = self.transport.send(request).await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text();
            tracing::error!(
                status = %status,
                body = %error_text,
                "Session refresh failed"
            );
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let data: RefreshResponse = response
            .json()
            .map_err(|e| RefreshError::InvalidResponse(format!("failed to parse body: {}", e)))?;

        if data.access_token.is_empty() {
            return Err(RefreshError::InvalidResponse(
                "response does not contain accessToken".to_string(),
            ));
        }

        // Servers that do not rotate keep the refresh token that was sent
        let refresh = match data.refresh_token {
            Some(token) if !token.is_empty() => RefreshToken::new(token),
            _ => {
                tracing::debug!("Refresh response did not rotate the refresh token");
                refresh_token.clone()
            }
        };

        tracing::info!("Session token refreshed");

        Ok(TokenPair {
            access: AccessToken::new(data.access_token),
            refresh,
        })
    }
}
