//! Credential-fetch handling and the client-facing error surface.
//!
//! One endpoint does the work: gate, authenticate, parse the profile, run
//! the vend pipeline with `mode = server`, and answer with the
//! credentials envelope or a sanitized error. Everything the client sees
//! comes from the fixed vocabulary in `VendError::client_message`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use sentinel_broker::vendor::{VendRequest, Vendor};
use sentinel_core::context::Mode;
use sentinel_core::error::VendError;
use sentinel_core::ratelimit::{MemoryRateLimiter, RateLimitDecision};

use crate::auth::BoundToken;

/// Who is on the other end of the transport.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Kernel-reported peer UID (Unix socket only).
    pub uid: Option<u32>,
    /// Kernel-reported peer PID; 0 when the transport cannot tell.
    pub pid: u32,
    /// Rate-limit key: pid for the socket, peer address for TCP.
    pub rate_key: String,
}

pub struct ServerState {
    pub vendor: Arc<Vendor>,
    pub token: BoundToken,
    /// Token always required on TCP; on the socket only when configured.
    pub token_required: bool,
    pub owner_uid: u32,
    pub gate: MemoryRateLimiter,
    pub deadline: Duration,
    /// The server's live session per profile: `profile → (id, version)`.
    pub sessions: Mutex<HashMap<String, (String, u64)>>,
}

#[derive(Debug, Deserialize)]
pub struct FetchParams {
    pub profile: String,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub session_table: Option<String>,
    /// Redeem this specific access request.
    #[serde(default)]
    pub request_id: Option<String>,
}

/// The single credentials endpoint, shared by both transports.
pub async fn handle_fetch(
    state: &ServerState,
    client: ClientIdentity,
    params: FetchParams,
    headers: &HeaderMap,
) -> Response {
    // 1. Front gate, before any work is done on the request.
    if let RateLimitDecision::Denied { retry_after_secs } = state.gate.check(&client.rate_key) {
        return ApiError::from(VendError::RateLimited { retry_after_secs }).into_response();
    }

    // 2. Authenticate.
    if let Err(err) = authenticate(state, &client, headers) {
        return ApiError::from(err).into_response();
    }

    // 3. Profile.
    if !is_valid_profile(&params.profile) {
        return ApiError {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_profile",
            message: "profile must be 1-64 characters of [A-Za-z0-9_-]".into(),
            retry_after_secs: None,
        }
        .into_response();
    }

    // 4. Refuse dead sessions before touching policy; a failed fetch must
    // not advance the session's last-accessed time.
    let existing = state.sessions.lock().get(&params.profile).cloned();
    let existing = match existing {
        Some((id, _stale_version)) => match state.vendor.check_session_live(&id).await {
            Ok(version) => Some((id, version)),
            Err(err) => {
                state.sessions.lock().remove(&params.profile);
                return ApiError::from(err).into_response();
            }
        },
        None => None,
    };

    // 5. The full pipeline, under the overall deadline.
    let request = VendRequest {
        profile: params.profile.clone(),
        requested_duration: params.duration_seconds.map(Duration::from_secs),
        device_id: params.device_id.clone(),
        session_table_override: params.session_table.clone(),
        session: existing,
        caller: None,
        approval_request_id: params.request_id.clone(),
    };
    let outcome = match tokio::time::timeout(state.deadline, state.vendor.vend(request, Mode::Server))
        .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => return ApiError::from(err).into_response(),
        Err(_) => return ApiError::from(VendError::Timeout).into_response(),
    };

    if let Some(ref session) = outcome.session {
        state
            .sessions
            .lock()
            .insert(params.profile, (session.id.clone(), session.version));
    }

    (StatusCode::OK, Json(outcome.credentials)).into_response()
}

fn authenticate(
    state: &ServerState,
    client: &ClientIdentity,
    headers: &HeaderMap,
) -> Result<(), VendError> {
    // Socket transport: the kernel says who is calling. Only the server's
    // owner gets in.
    if let Some(uid) = client.uid
        && uid != state.owner_uid
    {
        tracing::warn!(uid, owner = state.owner_uid, "peer uid mismatch");
        return Err(VendError::Unauthorized);
    }

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) => state.token.verify(token, client.pid),
        None if state.token_required => Err(VendError::Unauthorized),
        None => Ok(()),
    }
}

fn is_valid_profile(profile: &str) -> bool {
    !profile.is_empty()
        && profile.len() <= 64
        && profile
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// What leaves the process: a status, a stable code, and a message from
/// the fixed vocabulary. Internal detail stays in the logs.
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl From<VendError> for ApiError {
    fn from(err: VendError) -> Self {
        tracing::info!(code = err.code(), %err, "request refused");
        let status = match &err {
            VendError::InvalidIdentity(_) => StatusCode::BAD_REQUEST,
            VendError::Unauthorized => StatusCode::UNAUTHORIZED,
            VendError::PolicyDeny { .. }
            | VendError::ModeRequired { .. }
            | VendError::ApprovalRequired(_)
            | VendError::BreakGlassRejected(_)
            | VendError::DevicePostureFailed(_) => StatusCode::FORBIDDEN,
            VendError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            VendError::ConcurrentModification => StatusCode::CONFLICT,
            VendError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            VendError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            VendError::PolicyLoadFailed(_)
            | VendError::PolicySignatureInvalid(_)
            | VendError::PolicyUnsigned(_)
            | VendError::PolicyVerificationUnavailable(_)
            | VendError::CredentialIssueFailed(_) => StatusCode::BAD_GATEWAY,
        };
        let retry_after_secs = match &err {
            VendError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        ApiError {
            status,
            code: err.code(),
            message: err.client_message(),
            retry_after_secs,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.code, "message": self.message });
        if let Some(secs) = self.retry_after_secs {
            body["retry_after_seconds"] = json!(secs);
        }
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs
            && let Ok(value) = secs.to_string().parse()
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_validation() {
        assert!(is_valid_profile("dev"));
        assert!(is_valid_profile("prod-us_east-1"));
        assert!(!is_valid_profile(""));
        assert!(!is_valid_profile("has space"));
        assert!(!is_valid_profile("dots.not.allowed"));
        assert!(!is_valid_profile(&"x".repeat(65)));
    }

    #[test]
    fn test_api_error_statuses() {
        assert_eq!(
            ApiError::from(VendError::Unauthorized).status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(VendError::PolicyDeny { reason: "no".into() }).status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(VendError::RateLimited { retry_after_secs: 9 }).status,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(VendError::ConcurrentModification).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(VendError::Timeout).status,
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_api_error_messages_are_sanitized() {
        let err = ApiError::from(VendError::CredentialIssueFailed(
            "arn:aws:iam::123456789012:role/prod failed".into(),
        ));
        assert!(!err.message.contains("arn:"));
        assert!(!err.message.contains("123456789012"));
    }

    #[test]
    fn test_rate_limit_hint_survives() {
        let err = ApiError::from(VendError::RateLimited { retry_after_secs: 31 });
        assert_eq!(err.retry_after_secs, Some(31));
        assert!(err.message.contains("31"));
    }
}
