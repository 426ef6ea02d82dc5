// Transport-neutral request/response descriptors and tagged request attempts

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AccessToken;
use crate::error::ApiError;

/// Outgoing HTTP request
///
/// The body is held as [`Bytes`] so a request can always be replayed.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl ApiRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Raw `Authorization` header, if any
    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
    }

    pub fn into_parts(self) -> (Method, Url, HeaderMap, Option<Bytes>) {
        (self.method, self.url, self.headers, self.body)
    }

    fn with_authorization(mut self, value: HeaderValue) -> Self {
        self.headers.insert(AUTHORIZATION, value);
        self
    }
}

/// Received HTTP response with a fully buffered body
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn from_parts(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// `Retry-After` in seconds (HTTP-date form is not interpreted)
    pub fn retry_after(&self) -> Option<u64> {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }
}

/// One attempt at sending a logical request
///
/// Attempts are immutable: attaching a credential or replaying produces a new
/// attempt. The retry marker travels with the attempt and is never inferred
/// from token state. All attempts of one logical request share an id.
#[derive(Debug, Clone)]
pub struct RequestAttempt {
    id: Uuid,
    request: ApiRequest,
    credential: Option<AccessToken>,
    retried: bool,
}

impl RequestAttempt {
    /// First attempt of a new logical request
    pub fn new(request: ApiRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            credential: None,
            retried: false,
        }
    }

    /// Attempt that has already used its single replay; a 401 on it is terminal
    pub fn already_retried(request: ApiRequest) -> Self {
        Self {
            retried: true,
            ..Self::new(request)
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &ApiRequest {
        &self.request
    }

    /// Access token this attempt was sent with
    pub fn credential(&self) -> Option<&AccessToken> {
        self.credential.as_ref()
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// Same attempt carrying `token` as its bearer credential; `None` leaves
    /// the request headers untouched
    pub(crate) fn authorized(&self, token: Option<AccessToken>) -> Result<Self, ApiError> {
        let Some(token) = token else {
            return Ok(self.clone());
        };

        let header = token
            .bearer_header()
            .map_err(|e| ApiError::InvalidRequest(format!("access token is not a valid header: {}", e)))?;

        Ok(Self {
            id: self.id,
            request: self.request.clone().with_authorization(header),
            credential: Some(token),
            retried: self.retried,
        })
    }

    /// Same attempt flagged as replayed
    pub(crate) fn mark_retried(self) -> Self {
        Self {
            retried: true,
            ..self
        }
    }
}

/// Resolve `path` under `base`, keeping the base path prefix
pub fn resolve_url(base: &Url, path: &str) -> Result<Url, ApiError> {
    let relative = path.trim_start_matches('/');
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(relative)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid path '{}': {}", path, e)))
}
