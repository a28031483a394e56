//! The broker-wide error taxonomy.
//!
//! Two audiences, two surfaces. Internal logs get the full story — ARNs,
//! parameter paths, backend messages. Clients get a short stable code and a
//! message drawn from a fixed vocabulary. The only internal detail that
//! crosses the boundary is the policy-authored deny reason and the
//! rate-limit reset hint, both intentional.

use thiserror::Error;

/// Everything that can go wrong between a credential request and a minted
/// session. The `String` payloads are internal detail: they are logged but
/// never serialized toward a client.
#[derive(Debug, Error)]
pub enum VendError {
    /// ARN parse or sanitization failure.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Parameter store read failed after retries.
    #[error("policy load failed: {0}")]
    PolicyLoadFailed(String),

    /// A signature was present but did not verify.
    #[error("policy signature invalid: {0}")]
    PolicySignatureInvalid(String),

    /// No signature found and enforcement is on.
    #[error("policy unsigned: {0}")]
    PolicyUnsigned(String),

    /// The verification call itself failed (network, permission).
    #[error("policy verification unavailable: {0}")]
    PolicyVerificationUnavailable(String),

    /// Policy evaluated to deny (or default deny). The reason is
    /// policy-authored and is shown to the client verbatim.
    #[error("denied by policy: {reason}")]
    PolicyDeny { reason: String },

    /// `require_server` / `require_server_session` not satisfied. The hint
    /// tells the client which invocation shape would satisfy the rule.
    #[error("mode required: {hint}")]
    ModeRequired { hint: String },

    /// No approved request matches this caller and profile.
    #[error("approval required: {0}")]
    ApprovalRequired(String),

    /// Optimistic-lock conflict on a state-machine record.
    #[error("concurrent modification")]
    ConcurrentModification,

    /// Break-glass invocation rejected (rate limit, justification,
    /// authorization).
    #[error("break-glass rejected: {0}")]
    BreakGlassRejected(String),

    /// MDM lookup failed under a fail-closed disposition.
    #[error("device posture unavailable: {0}")]
    DevicePostureFailed(String),

    /// STS call failed after retries.
    #[error("credential issue failed: {0}")]
    CredentialIssueFailed(String),

    /// Local-server authentication failed.
    #[error("unauthorized")]
    Unauthorized,

    /// The request limiter denied the call.
    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The caller cancelled the request.
    #[error("cancelled")]
    Cancelled,

    /// The overall request deadline expired.
    #[error("timed out")]
    Timeout,
}

impl VendError {
    /// Short stable code for the client-facing surface and for log
    /// correlation. Codes never change once shipped.
    pub fn code(&self) -> &'static str {
        match self {
            VendError::InvalidIdentity(_) => "invalid_identity",
            VendError::PolicyLoadFailed(_) => "policy_load_failed",
            VendError::PolicySignatureInvalid(_) => "policy_signature_invalid",
            VendError::PolicyUnsigned(_) => "policy_unsigned",
            VendError::PolicyVerificationUnavailable(_) => "policy_verification_unavailable",
            VendError::PolicyDeny { .. } => "policy_deny",
            VendError::ModeRequired { .. } => "mode_required",
            VendError::ApprovalRequired(_) => "approval_required",
            VendError::ConcurrentModification => "concurrent_modification",
            VendError::BreakGlassRejected(_) => "break_glass_rejected",
            VendError::DevicePostureFailed(_) => "device_posture_failed",
            VendError::CredentialIssueFailed(_) => "credential_issue_failed",
            VendError::Unauthorized => "unauthorized",
            VendError::RateLimited { .. } => "rate_limited",
            VendError::Cancelled => "cancelled",
            VendError::Timeout => "timeout",
        }
    }

    /// The message a client is allowed to see. Fixed vocabulary; no path,
    /// ARN, or backend text is ever interpolated here. The two exceptions
    /// are deliberate: the policy-authored deny reason and the rate-limit
    /// reset hint.
    pub fn client_message(&self) -> String {
        match self {
            VendError::InvalidIdentity(_) => "caller identity could not be resolved".into(),
            VendError::PolicyLoadFailed(_) => "policy could not be loaded".into(),
            VendError::PolicySignatureInvalid(_) => "policy signature is invalid".into(),
            VendError::PolicyUnsigned(_) => "policy is not signed".into(),
            VendError::PolicyVerificationUnavailable(_) => {
                "policy signature could not be verified".into()
            }
            VendError::PolicyDeny { reason } => reason.clone(),
            VendError::ModeRequired { hint } => hint.clone(),
            VendError::ApprovalRequired(_) => {
                "an approved access request is required for this profile".into()
            }
            VendError::ConcurrentModification => {
                "the record was modified concurrently; re-read and retry".into()
            }
            VendError::BreakGlassRejected(_) => "break-glass invocation was rejected".into(),
            VendError::DevicePostureFailed(_) => "device posture could not be determined".into(),
            VendError::CredentialIssueFailed(_) => "credentials could not be issued".into(),
            VendError::Unauthorized => "unauthorized".into(),
            VendError::RateLimited { retry_after_secs } => {
                format!("rate limited, retry in {retry_after_secs}s")
            }
            VendError::Cancelled => "request cancelled".into(),
            VendError::Timeout => "request timed out".into(),
        }
    }

    /// Whether a retry with backoff is worth attempting. Policy decisions
    /// and state-machine conflicts are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VendError::PolicyLoadFailed(_)
                | VendError::PolicyVerificationUnavailable(_)
                | VendError::CredentialIssueFailed(_)
        )
    }
}
