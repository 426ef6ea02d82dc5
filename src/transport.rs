use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::request::{ApiRequest, ApiResponse};

/// Category of a failed send, derived from the underlying client error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Request,
    Body,
    Decode,
    Other,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connection_failed",
            TransportErrorKind::Request => "request_error",
            TransportErrorKind::Body => "body_error",
            TransportErrorKind::Decode => "decode_error",
            TransportErrorKind::Other => "unknown",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The request never produced an HTTP response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("HTTP request failed: {message} (kind: {kind})")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_connect() {
            TransportErrorKind::Connect
        } else if e.is_request() {
            TransportErrorKind::Request
        } else if e.is_body() {
            TransportErrorKind::Body
        } else if e.is_decode() {
            TransportErrorKind::Decode
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, e.to_string())
    }
}

/// Sends a single HTTP request with no interpretation of the response
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// [`Transport`] backed by a pooled `reqwest` client
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(max_connections: usize, connect_timeout: u64, request_timeout: u64) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let (method, url, headers, body) = request.into_parts();

        let mut builder = self.client.request(method, url.clone()).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            let err = TransportError::from(e);
            tracing::warn!(
                error_kind = %err.kind,
                error = %err.message,
                url = %url,
                "HTTP request error"
            );
            err
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(ApiResponse::from_parts(status, headers, body))
    }
}

/// Scripted in-process transport for tests
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Semaphore;

    type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync;

    /// Answers every request with a handler closure and records what was sent
    pub struct MockTransport {
        handler: Box<Handler>,
        sent: Mutex<Vec<ApiRequest>>,
        gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    }

    impl MockTransport {
        pub fn new(
            handler: impl Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                handler: Box::new(handler),
                sent: Mutex::new(Vec::new()),
                gates: Mutex::new(HashMap::new()),
            }
        }

        /// Hold requests to `path` until a permit is added to the returned gate
        pub fn hold(&self, path: &str) -> Arc<Semaphore> {
            let gate = Arc::new(Semaphore::new(0));
            self.gates
                .lock()
                .unwrap()
                .insert(path.to_string(), gate.clone());
            gate
        }

        /// Every request received so far, in arrival order
        pub fn sent(&self) -> Vec<ApiRequest> {
            self.sent.lock().unwrap().clone()
        }

        pub fn count(&self, path: &str) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.path() == path)
                .count()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
            self.sent.lock().unwrap().push(request.clone());

            let gate = self.gates.lock().unwrap().get(request.path()).cloned();
            if let Some(gate) = gate {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;
            }

            (self.handler)(&request)
        }
    }
}
