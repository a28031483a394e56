//! The credential vend pipeline.
//!
//! One function, eleven steps: resolve the caller, load and verify
//! policy, build the decision context, resolve posture if the policy
//! cares, evaluate, branch on the effect (redeeming approvals or live
//! break-glass events where the effect calls for them), stamp the
//! SourceIdentity, call STS, track the session in server mode, and write
//! the signed decision record. Both the one-shot entry and the local
//! server come through here — there is no second path to credentials.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use sentinel_core::audit::{AuditLog, DecisionRecord};
use sentinel_core::context::{DecisionContext, Mode};
use sentinel_core::error::VendError;
use sentinel_core::identity::{Caller, caller_from_arn};
use sentinel_core::policy::{Decision, Effect, evaluate};
use sentinel_core::posture::is_valid_device_id;
use sentinel_core::ratelimit::RateLimitDecision;
use sentinel_core::source_identity::{DIRECT_MARKER, SourceIdentity};

use serde::Serialize;

use crate::approval::{ApprovalError, ApprovalStore};
use crate::breakglass::BreakGlassStore;
use crate::config::BrokerConfig;
use crate::notify::Notifier;
use crate::policy_loader::PolicyLoader;
use crate::posture::{HttpMdmProvider, PostureClient};
use crate::ratelimit::BrokerRateLimiter;
use crate::retry::{is_transient_sdk, with_backoff};
use crate::session::{Session, SessionStatus, SessionTracker};

/// STS floors role sessions at 15 minutes.
const STS_MIN_DURATION_SECS: u64 = 900;

pub type AuditSink = AuditLog<Box<dyn std::io::Write + Send>>;

/// What the client receives. Field names are the credential_process wire
/// contract; do not rename.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialsEnvelope {
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "Token")]
    pub token: String,
    /// RFC 3339.
    #[serde(rename = "Expiration")]
    pub expiration: String,
}

/// One vend. The server path supplies `caller` (from its authenticated
/// transport) and possibly an existing `session`; the one-shot path
/// leaves `caller` empty and is resolved through STS GetCallerIdentity.
#[derive(Debug, Clone, Default)]
pub struct VendRequest {
    pub profile: String,
    pub requested_duration: Option<Duration>,
    pub device_id: Option<String>,
    pub session_table_override: Option<String>,
    /// `(id, version)` of the server session this fetch belongs to.
    pub session: Option<(String, u64)>,
    pub caller: Option<Caller>,
    /// Redeem this specific access request instead of searching.
    pub approval_request_id: Option<String>,
}

#[derive(Debug)]
pub struct VendOutcome {
    pub credentials: CredentialsEnvelope,
    pub source_identity: SourceIdentity,
    pub decision: Decision,
    pub session: Option<Session>,
}

pub struct Vendor {
    sts: aws_sdk_sts::Client,
    db: aws_sdk_dynamodb::Client,
    loader: Arc<PolicyLoader>,
    posture: Option<Arc<PostureClient<HttpMdmProvider>>>,
    approvals: Arc<ApprovalStore>,
    breakglass: Arc<BreakGlassStore>,
    limiter: Arc<BrokerRateLimiter>,
    notifier: Arc<Notifier>,
    audit: Arc<AuditSink>,
    config: BrokerConfig,
}

impl Vendor {
    pub fn new(
        sts: aws_sdk_sts::Client,
        db: aws_sdk_dynamodb::Client,
        loader: Arc<PolicyLoader>,
        posture: Option<Arc<PostureClient<HttpMdmProvider>>>,
        approvals: Arc<ApprovalStore>,
        breakglass: Arc<BreakGlassStore>,
        limiter: Arc<BrokerRateLimiter>,
        notifier: Arc<Notifier>,
        audit: Arc<AuditSink>,
        config: BrokerConfig,
    ) -> Self {
        Vendor {
            sts,
            db,
            loader,
            posture,
            approvals,
            breakglass,
            limiter,
            notifier,
            audit,
            config,
        }
    }

    /// Run the full pipeline for one request.
    pub async fn vend(&self, request: VendRequest, mode: Mode) -> Result<VendOutcome, VendError> {
        // 1. Caller identity — shared extractor, both entry paths.
        let caller = match request.caller.clone() {
            Some(caller) => caller,
            None => self.whoami(request.device_id.clone()).await?,
        };

        let subject = format!("{}:{}", caller.sanitized_username, request.profile);
        if let RateLimitDecision::Denied { retry_after_secs } = self.limiter.check(&subject).await {
            return Err(VendError::RateLimited { retry_after_secs });
        }

        // 2. Policy, verified and cached.
        let policy = self.loader.load(&request.profile).await?;

        // 3. Decision context with a fresh request id.
        let mut ctx = DecisionContext::new(caller, request.profile.clone(), mode);
        ctx.session_table_override = request.session_table_override.clone();

        // 4. Posture, only when some rule actually asserts a device
        // condition. A malformed device id is treated as no device.
        let device_id = ctx.caller.device_id.clone().filter(|id| {
            let ok = is_valid_device_id(id);
            if !ok {
                tracing::warn!(user = %ctx.caller.sanitized_username, "malformed device id ignored");
            }
            ok
        });
        if policy.mentions_device()
            && let Some(ref id) = device_id
            && let Some(ref posture) = self.posture
        {
            ctx.device_posture = Some(posture.resolve(id).await?);
        }

        // 5. Evaluate.
        let decision = evaluate(&policy, &ctx);

        // 6. Branch on effect.
        let marker = self.resolve_marker(&decision, &ctx, &request).await;
        let marker = match marker {
            Ok(marker) => marker,
            Err(err) => {
                self.log_decision(&ctx, &decision, "-", "", 0, device_id.is_some());
                return Err(err);
            }
        };

        // 7. SourceIdentity: username truncates, marker and request id
        // never do.
        let source_identity =
            SourceIdentity::compose(&ctx.caller.sanitized_username, &marker, &ctx.request_id)?;

        // 8. AssumeRole.
        let duration = self.effective_duration(mode, request.requested_duration);
        let role_arn = self.loader.role_arn(&request.profile).await?;
        let credentials = self
            .assume_role(&role_arn, &source_identity, duration)
            .await?;

        // 9. Session tracking in server mode.
        let session = if mode == Mode::Server {
            self.track_session(&ctx, &decision, &request, &source_identity, duration)
                .await?
        } else {
            None
        };

        // 10. Signed decision record.
        self.log_decision(
            &ctx,
            &decision,
            &marker,
            &source_identity.render(),
            duration.as_secs() as i64,
            device_id.is_some(),
        );

        // 11. Envelope.
        Ok(VendOutcome {
            credentials,
            source_identity,
            decision,
            session,
        })
    }

    /// Resolve the caller for the one-shot path via STS.
    async fn whoami(&self, device_id: Option<String>) -> Result<Caller, VendError> {
        let sts = self.sts.clone();
        let out = with_backoff("sts_get_caller_identity", is_transient_sdk, || {
            sts.get_caller_identity().send()
        })
        .await
        .map_err(|e| VendError::InvalidIdentity(e.into_service_error().to_string()))?;

        let arn = out
            .arn()
            .ok_or_else(|| VendError::InvalidIdentity("sts returned no arn".into()))?;
        caller_from_arn(arn, device_id)
    }

    /// Turn the decided effect into an approval marker, or refuse.
    async fn resolve_marker(
        &self,
        decision: &Decision,
        ctx: &DecisionContext,
        request: &VendRequest,
    ) -> Result<String, VendError> {
        match decision.effect {
            Effect::Allow => Ok(DIRECT_MARKER.to_string()),

            Effect::Deny => {
                // A live break-glass event overrides a policy deny; that
                // is its entire purpose. The bg marker keeps the override
                // visible downstream.
                if let Some(marker) = self.breakglass_override(ctx).await {
                    return Ok(marker);
                }
                Err(VendError::PolicyDeny {
                    reason: decision.reason.clone(),
                })
            }

            Effect::RequireApproval => {
                let redeemed = match request.approval_request_id {
                    Some(ref id) => match self.approvals.redeem(id, &ctx.caller).await {
                        Ok(marker) => Some(marker),
                        Err(err) => {
                            tracing::info!(%err, id, "approval redemption refused");
                            None
                        }
                    },
                    None => self
                        .approvals
                        .redeemable_marker(&ctx.caller, &ctx.profile)
                        .await
                        .unwrap_or_else(|err| {
                            tracing::warn!(%err, "approval lookup failed");
                            None
                        }),
                };
                if let Some(marker) = redeemed {
                    return Ok(marker);
                }
                if let Some(marker) = self.breakglass_override(ctx).await {
                    return Ok(marker);
                }
                Err(VendError::ApprovalRequired(format!(
                    "no approved request for {} on {}",
                    ctx.caller.sanitized_username, ctx.profile
                )))
            }

            Effect::RequireServer => {
                if ctx.mode != Mode::Server {
                    return Err(VendError::ModeRequired {
                        hint: "this profile is served only by the local sentinel server; \
                               start it and point your tooling at its endpoint"
                            .into(),
                    });
                }
                Ok(DIRECT_MARKER.to_string())
            }

            Effect::RequireServerSession => {
                if ctx.mode != Mode::Server {
                    return Err(VendError::ModeRequired {
                        hint: "this profile is served only by the local sentinel server; \
                               start it and point your tooling at its endpoint"
                            .into(),
                    });
                }
                if self.session_table_binding(decision, ctx).is_none() {
                    return Err(VendError::ModeRequired {
                        hint: "this profile requires session tracking; restart the server \
                               with a session table configured"
                            .into(),
                    });
                }
                Ok(DIRECT_MARKER.to_string())
            }
        }
    }

    async fn breakglass_override(&self, ctx: &DecisionContext) -> Option<String> {
        match self
            .breakglass
            .active_marker(&ctx.caller.sanitized_username, &ctx.profile)
            .await
        {
            Ok(Some(marker)) => {
                tracing::warn!(
                    user = %ctx.caller.sanitized_username,
                    profile = %ctx.profile,
                    marker,
                    "break-glass override applied"
                );
                Some(marker)
            }
            Ok(None) => None,
            Err(err) => {
                // An outage in the break-glass store must not widen
                // access: no override.
                tracing::warn!(%err, "break-glass lookup failed");
                None
            }
        }
    }

    /// `rule.session_table → caller override → environment default`.
    fn session_table_binding(&self, decision: &Decision, ctx: &DecisionContext) -> Option<String> {
        decision
            .session_table
            .clone()
            .or_else(|| ctx.session_table_override.clone())
            .or_else(|| self.config.sessions_table.clone())
    }

    fn effective_duration(&self, mode: Mode, requested: Option<Duration>) -> Duration {
        let default = match mode {
            Mode::Server => self.config.server_default_duration,
            _ => self.config.default_duration,
        };
        let duration = requested.unwrap_or(default).min(self.config.max_duration);
        duration.max(Duration::from_secs(STS_MIN_DURATION_SECS))
    }

    async fn assume_role(
        &self,
        role_arn: &str,
        source_identity: &SourceIdentity,
        duration: Duration,
    ) -> Result<CredentialsEnvelope, VendError> {
        let sts = self.sts.clone();
        let stamp = source_identity.render();
        let session_name = format!("sentinel-{}", source_identity.request_id);
        let out = with_backoff("sts_assume_role", is_transient_sdk, || {
            sts.assume_role()
                .role_arn(role_arn)
                .role_session_name(&session_name)
                .source_identity(&stamp)
                .duration_seconds(duration.as_secs() as i32)
                .send()
        })
        .await
        .map_err(|e| VendError::CredentialIssueFailed(e.into_service_error().to_string()))?;

        let credentials = out
            .credentials()
            .ok_or_else(|| VendError::CredentialIssueFailed("sts returned no credentials".into()))?;
        let expiration = chrono::DateTime::from_timestamp(
            credentials.expiration().secs(),
            credentials.expiration().subsec_nanos(),
        )
        .ok_or_else(|| VendError::CredentialIssueFailed("sts returned a bad expiration".into()))?;

        Ok(CredentialsEnvelope {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            token: credentials.session_token().to_string(),
            expiration: expiration.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        })
    }

    /// Create or touch the server session, after the STS call succeeded —
    /// a failed fetch must leave `last_accessed_at` untouched.
    async fn track_session(
        &self,
        ctx: &DecisionContext,
        decision: &Decision,
        request: &VendRequest,
        source_identity: &SourceIdentity,
        duration: Duration,
    ) -> Result<Option<Session>, VendError> {
        let Some(table) = self.session_table_binding(decision, ctx) else {
            return Ok(None);
        };
        let tracker = SessionTracker::new(
            self.db.clone(),
            table,
            self.config.session_lease,
            Arc::clone(&self.notifier),
        );

        match request.session {
            Some((ref id, version)) => {
                let session = tracker.touch(id, version).await.map_err(|err| match err {
                    crate::session::SessionError::ConcurrentModification => {
                        VendError::ConcurrentModification
                    }
                    other => VendError::CredentialIssueFailed(other.to_string()),
                })?;
                Ok(Some(session))
            }
            None => {
                let session = tracker
                    .create(
                        &source_identity.render(),
                        ctx.caller.device_id.as_deref(),
                        &ctx.profile,
                        &ctx.caller.sanitized_username,
                        duration,
                    )
                    .await
                    .map_err(|e| VendError::CredentialIssueFailed(e.to_string()))?;
                Ok(Some(session))
            }
        }
    }

    /// Verify a server session is still honored before evaluation. A
    /// revoked or expired session is refused without advancing
    /// `last_accessed_at`.
    pub async fn check_session_live(&self, session_id: &str) -> Result<u64, VendError> {
        let Some(ref table) = self.config.sessions_table else {
            return Err(VendError::Unauthorized);
        };
        let tracker = SessionTracker::new(
            self.db.clone(),
            table.clone(),
            self.config.session_lease,
            Arc::clone(&self.notifier),
        );
        let session = tracker
            .lookup(session_id)
            .await
            .map_err(|_| VendError::Unauthorized)?;
        if session.status != SessionStatus::Active || !session.is_live(Utc::now()) {
            tracing::warn!(
                id = session_id,
                status = session.status.as_str(),
                "refusing fetch on dead session"
            );
            return Err(VendError::Unauthorized);
        }
        Ok(session.version)
    }

    /// Run the periodic expiry sweeps. Best-effort; errors are logged.
    pub async fn sweep(&self) {
        let now = Utc::now();
        match self.approvals.expire_sweep(now).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(n, "expired lapsed access requests"),
            Err(err) => tracing::warn!(%err, "approval sweep failed"),
        }
        match self.breakglass.expire_sweep(now).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(n, "expired lapsed break-glass events"),
            Err(err) => tracing::warn!(%err, "break-glass sweep failed"),
        }
    }

    pub fn approvals(&self) -> &ApprovalStore {
        &self.approvals
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn log_decision(
        &self,
        ctx: &DecisionContext,
        decision: &Decision,
        marker: &str,
        source_identity: &str,
        duration_seconds: i64,
        device_bound: bool,
    ) {
        let record = DecisionRecord {
            timestamp: ctx.request_time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            user: ctx.caller.sanitized_username.clone(),
            profile: ctx.profile.clone(),
            effect: decision.effect.as_str().to_string(),
            rule: decision.matched_rule.clone().unwrap_or_else(|| "-".into()),
            approval_marker: marker.to_string(),
            request_id: ctx.request_id.clone(),
            source_identity: source_identity.to_string(),
            duration_seconds,
            device_bound,
            hmac: String::new(),
        };
        if let Err(err) = self.audit.append(record) {
            tracing::error!(%err, "decision record write failed");
        }
    }
}

/// Map a redemption failure to the client-facing kind the pipeline
/// promises.
impl From<ApprovalError> for VendError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::ConcurrentModification => VendError::ConcurrentModification,
            ApprovalError::RateLimited { retry_after_secs } => {
                VendError::RateLimited { retry_after_secs }
            }
            other => VendError::ApprovalRequired(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_field_names() {
        let envelope = CredentialsEnvelope {
            access_key_id: "AKIAEXAMPLE".into(),
            secret_access_key: "secret".into(),
            token: "token".into(),
            expiration: "2024-03-04T15:00:00Z".into(),
        };
        let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["AccessKeyId"], "AKIAEXAMPLE");
        assert_eq!(value["SecretAccessKey"], "secret");
        assert_eq!(value["Token"], "token");
        assert_eq!(value["Expiration"], "2024-03-04T15:00:00Z");
        assert_eq!(value.as_object().unwrap().len(), 4);
    }

    #[test]
    fn test_approval_error_mapping() {
        assert!(matches!(
            VendError::from(ApprovalError::ConcurrentModification),
            VendError::ConcurrentModification
        ));
        assert!(matches!(
            VendError::from(ApprovalError::WrongCaller),
            VendError::ApprovalRequired(_)
        ));
        assert!(matches!(
            VendError::from(ApprovalError::RateLimited { retry_after_secs: 5 }),
            VendError::RateLimited { retry_after_secs: 5 }
        ));
    }
}
