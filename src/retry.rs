// Single replay of a request rejected with 401

use crate::auth::AccessToken;
use crate::error::ApiError;
use crate::request::RequestAttempt;

/// Build the one permitted replay of `attempt`, carrying `token`
///
/// The replay keeps the attempt id, method, URL, headers and body; only the
/// `Authorization` header changes. It is marked as retried, so a 401 on it
/// is terminal. An attempt that was already replayed cannot be replayed again.
pub fn replay(attempt: &RequestAttempt, token: &AccessToken) -> Result<RequestAttempt, ApiError> {
    if attempt.is_retried() {
        return Err(ApiError::InvalidRequest(format!(
            "request attempt {} was already replayed",
            attempt.id()
        )));
    }

    let replayed = attempt.authorized(Some(token.clone()))?.mark_retried();

    tracing::debug!(
        attempt_id = %replayed.id(),
        method = %replayed.request().method(),
        url = %replayed.request().url(),
        "Replaying request with refreshed token"
    );

    Ok(replayed)
}
