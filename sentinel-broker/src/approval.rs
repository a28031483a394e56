//! Access-request approval workflow.
//!
//! A DynamoDB-backed state machine: `pending → {approved, denied,
//! expired, cancelled}`, terminal states absorbing. Every mutation is one
//! conditional write asserting the record's current version; a lost race
//! surfaces as `ConcurrentModification` and is never retried here — the
//! losing side may be a legitimately concurrent transition.

use std::collections::HashMap;
use std::sync::Arc;

use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sentinel_core::context::DecisionContext;
use sentinel_core::identity::Caller;
use sentinel_core::policy::conditions_match;
use sentinel_core::policy::types::RuleConditions;

use crate::notify::{LifecycleEvent, Notifier};
use crate::ratelimit::BrokerRateLimiter;
use crate::retry::{is_transient_sdk, with_backoff};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("request is {0}, not pending")]
    NotPending(String),
    #[error("concurrent modification")]
    ConcurrentModification,
    #[error("{0} is not an approver for this profile")]
    NotApprover(String),
    #[error("only the requester may cancel")]
    NotRequester,
    #[error("request is {0}, not approved")]
    NotApproved(String),
    #[error("approval has expired")]
    Expired,
    #[error("request belongs to a different caller")]
    WrongCaller,
    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("request not found")]
    NotFound,
    #[error("store error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Denied => "denied",
            RequestStatus::Expired => "expired",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<RequestStatus> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "approved" => Some(RequestStatus::Approved),
            "denied" => Some(RequestStatus::Denied),
            "expired" => Some(RequestStatus::Expired),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

/// One access request. The marker is assigned at submit but only becomes
/// meaningful — and visible through `visible_marker` — once approved.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessRequest {
    pub id: String,
    pub requester: String,
    pub profile: String,
    pub justification: String,
    pub duration_seconds: i64,
    pub status: RequestStatus,
    pub marker: String,
    pub approved_by: Option<String>,
    pub denial_reason: Option<String>,
    pub approvers_notified: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

impl AccessRequest {
    /// The 8-hex approval marker, present only on approved requests.
    pub fn visible_marker(&self) -> Option<&str> {
        (self.status == RequestStatus::Approved).then_some(self.marker.as_str())
    }

    fn ensure_pending(&self) -> Result<(), ApprovalError> {
        if self.status != RequestStatus::Pending {
            return Err(ApprovalError::NotPending(self.status.as_str().into()));
        }
        Ok(())
    }
}

/// An auto-approve clause. Conditions use the same semantics as policy
/// rules; a submission whose context matches is approved in the same
/// write that creates it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoApproveRule {
    pub name: String,
    #[serde(default)]
    pub conditions: RuleConditions,
}

#[derive(Debug, Clone)]
pub struct ApprovalSettings {
    pub request_ttl: chrono::Duration,
    pub max_duration_seconds: i64,
    /// Approvers per profile; `*` is the fallback entry.
    pub approvers: HashMap<String, Vec<String>>,
    pub auto_approve: Vec<AutoApproveRule>,
}

impl ApprovalSettings {
    pub fn approvers_for(&self, profile: &str) -> &[String] {
        self.approvers
            .get(profile)
            .or_else(|| self.approvers.get("*"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

pub struct ApprovalStore {
    db: aws_sdk_dynamodb::Client,
    table: String,
    settings: ApprovalSettings,
    limiter: Arc<BrokerRateLimiter>,
    notifier: Arc<Notifier>,
}

impl ApprovalStore {
    pub fn new(
        db: aws_sdk_dynamodb::Client,
        table: impl Into<String>,
        settings: ApprovalSettings,
        limiter: Arc<BrokerRateLimiter>,
        notifier: Arc<Notifier>,
    ) -> Self {
        ApprovalStore {
            db,
            table: table.into(),
            settings,
            limiter,
            notifier,
        }
    }

    /// Create a request in `pending` (or directly `approved` when an
    /// auto-approve clause matches the submission context).
    pub async fn submit(
        &self,
        ctx: &DecisionContext,
        justification: &str,
        duration_seconds: i64,
    ) -> Result<AccessRequest, ApprovalError> {
        let subject = format!("{}:{}", ctx.caller.sanitized_username, ctx.profile);
        if let sentinel_core::ratelimit::RateLimitDecision::Denied { retry_after_secs } =
            self.limiter.check(&subject).await
        {
            return Err(ApprovalError::RateLimited { retry_after_secs });
        }

        validate_justification(justification)?;
        if duration_seconds <= 0 || duration_seconds > self.settings.max_duration_seconds {
            return Err(ApprovalError::Validation(format!(
                "duration must be 1..={} seconds",
                self.settings.max_duration_seconds
            )));
        }

        let auto = self
            .settings
            .auto_approve
            .iter()
            .find(|rule| conditions_match(&rule.conditions, ctx));

        let now = Utc::now();
        let request = AccessRequest {
            id: new_request_record_id(),
            requester: ctx.caller.sanitized_username.clone(),
            profile: ctx.profile.clone(),
            justification: justification.to_string(),
            duration_seconds,
            status: if auto.is_some() {
                RequestStatus::Approved
            } else {
                RequestStatus::Pending
            },
            marker: new_approval_marker(),
            approved_by: auto.map(|rule| format!("auto:{}", rule.name)),
            denial_reason: None,
            approvers_notified: self.settings.approvers_for(&ctx.profile).to_vec(),
            created_at: now,
            expires_at: now + self.settings.request_ttl,
            version: 1,
        };

        let db = self.db.clone();
        let table = self.table.clone();
        let item = to_item(&request);
        with_backoff("ddb_put_request", is_transient_sdk, || {
            db.put_item()
                .table_name(&table)
                .set_item(Some(item.clone()))
                .condition_expression("attribute_not_exists(id)")
                .send()
        })
        .await
        .map_err(|e| ApprovalError::Backend(e.into_service_error().to_string()))?;

        tracing::info!(
            id = %request.id,
            requester = %request.requester,
            profile = %request.profile,
            auto_approved = request.status == RequestStatus::Approved,
            "access request submitted"
        );
        self.notifier
            .publish(LifecycleEvent::RequestSubmitted {
                id: request.id.clone(),
                requester: request.requester.clone(),
                profile: request.profile.clone(),
                expires_at: request.expires_at.to_rfc3339(),
            })
            .await;
        Ok(request)
    }

    /// `pending → approved`. The approver must be in the profile's
    /// approver set and must present the version they read.
    pub async fn approve(
        &self,
        id: &str,
        approver: &str,
        expected_version: u64,
    ) -> Result<AccessRequest, ApprovalError> {
        let request = self.get(id).await?;
        request.ensure_pending()?;
        if !self
            .settings
            .approvers_for(&request.profile)
            .iter()
            .any(|a| a == approver)
        {
            return Err(ApprovalError::NotApprover(approver.to_string()));
        }

        let approved = self
            .transition(
                id,
                expected_version,
                RequestStatus::Approved,
                [("approved_by", AttributeValue::S(approver.to_string()))],
            )
            .await?;
        self.notifier
            .publish(LifecycleEvent::RequestApproved {
                id: approved.id.clone(),
                approver: approver.to_string(),
                profile: approved.profile.clone(),
            })
            .await;
        Ok(approved)
    }

    /// `pending → denied`, recording the reason.
    pub async fn deny(
        &self,
        id: &str,
        approver: &str,
        expected_version: u64,
        reason: &str,
    ) -> Result<AccessRequest, ApprovalError> {
        let request = self.get(id).await?;
        request.ensure_pending()?;
        if !self
            .settings
            .approvers_for(&request.profile)
            .iter()
            .any(|a| a == approver)
        {
            return Err(ApprovalError::NotApprover(approver.to_string()));
        }

        self.transition(
            id,
            expected_version,
            RequestStatus::Denied,
            [
                ("approved_by", AttributeValue::S(approver.to_string())),
                ("denial_reason", AttributeValue::S(reason.to_string())),
            ],
        )
        .await
    }

    /// `pending → cancelled`, requester only.
    pub async fn cancel(
        &self,
        id: &str,
        requester: &str,
        expected_version: u64,
    ) -> Result<AccessRequest, ApprovalError> {
        let request = self.get(id).await?;
        request.ensure_pending()?;
        if request.requester != requester {
            return Err(ApprovalError::NotRequester);
        }
        self.transition(id, expected_version, RequestStatus::Cancelled, [])
            .await
    }

    /// Read an approved request for redemption: the caller must be the
    /// requester and the approval must not have lapsed. Returns the
    /// 8-hex approval marker for SourceIdentity stamping.
    pub async fn redeem(&self, id: &str, caller: &Caller) -> Result<String, ApprovalError> {
        let request = self.get(id).await?;
        if request.status != RequestStatus::Approved {
            return Err(ApprovalError::NotApproved(request.status.as_str().into()));
        }
        if request.requester != caller.sanitized_username {
            return Err(ApprovalError::WrongCaller);
        }
        if request.expires_at < Utc::now() {
            return Err(ApprovalError::Expired);
        }
        Ok(request.marker)
    }

    /// Find the newest redeemable request for a caller+profile. Used by
    /// the vend pipeline, which knows the profile but not a request id.
    pub async fn redeemable_marker(
        &self,
        caller: &Caller,
        profile: &str,
    ) -> Result<Option<String>, ApprovalError> {
        let db = self.db.clone();
        let table = self.table.clone();
        let out = with_backoff("ddb_query_requests", is_transient_sdk, || {
            db.query()
                .table_name(&table)
                .index_name("by_requester")
                .key_condition_expression("requester = :r")
                .filter_expression("#st = :approved AND profile = :p AND expires_epoch > :now")
                .expression_attribute_names("#st", "status")
                .expression_attribute_values(":r", AttributeValue::S(caller.sanitized_username.clone()))
                .expression_attribute_values(":approved", AttributeValue::S("approved".into()))
                .expression_attribute_values(":p", AttributeValue::S(profile.to_string()))
                .expression_attribute_values(
                    ":now",
                    AttributeValue::N(Utc::now().timestamp().to_string()),
                )
                .send()
        })
        .await
        .map_err(|e| ApprovalError::Backend(e.into_service_error().to_string()))?;

        let mut requests: Vec<AccessRequest> = out
            .items()
            .iter()
            .filter_map(|item| from_item(item).ok())
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests.into_iter().next().map(|r| r.marker))
    }

    pub async fn get(&self, id: &str) -> Result<AccessRequest, ApprovalError> {
        let db = self.db.clone();
        let table = self.table.clone();
        let out = with_backoff("ddb_get_request", is_transient_sdk, || {
            db.get_item()
                .table_name(&table)
                .key("id", AttributeValue::S(id.to_string()))
                .consistent_read(true)
                .send()
        })
        .await
        .map_err(|e| ApprovalError::Backend(e.into_service_error().to_string()))?;

        match out.item() {
            Some(item) => from_item(item),
            None => Err(ApprovalError::NotFound),
        }
    }

    /// Transition every lapsed `pending` record to `expired`. Best-effort
    /// and idempotent: races with real transitions are simply skipped.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> Result<u32, ApprovalError> {
        let db = self.db.clone();
        let table = self.table.clone();
        let out = with_backoff("ddb_scan_pending", is_transient_sdk, || {
            db.scan()
                .table_name(&table)
                .filter_expression("#st = :pending AND expires_epoch < :now")
                .expression_attribute_names("#st", "status")
                .expression_attribute_values(":pending", AttributeValue::S("pending".into()))
                .expression_attribute_values(":now", AttributeValue::N(now.timestamp().to_string()))
                .send()
        })
        .await
        .map_err(|e| ApprovalError::Backend(e.into_service_error().to_string()))?;

        let mut expired = 0;
        for item in out.items() {
            let Ok(request) = from_item(item) else {
                continue;
            };
            match self
                .transition(&request.id, request.version, RequestStatus::Expired, [])
                .await
            {
                Ok(_) => expired += 1,
                // Someone approved, denied, or cancelled it first. Fine.
                Err(ApprovalError::ConcurrentModification) => {}
                Err(err) => {
                    tracing::warn!(id = %request.id, %err, "expiry sweep skipped a record");
                }
            }
        }
        Ok(expired)
    }

    /// The single conditional write every mutation goes through: asserts
    /// both the expected version and that the record is still pending.
    async fn transition(
        &self,
        id: &str,
        expected_version: u64,
        to: RequestStatus,
        extra: impl IntoIterator<Item = (&'static str, AttributeValue)>,
    ) -> Result<AccessRequest, ApprovalError> {
        let mut update = String::from("SET #st = :to, version = :next");
        let mut req = self
            .db
            .update_item()
            .table_name(&self.table)
            .key("id", AttributeValue::S(id.to_string()))
            .condition_expression("version = :expected AND #st = :pending")
            .expression_attribute_names("#st", "status")
            .expression_attribute_values(":to", AttributeValue::S(to.as_str().into()))
            .expression_attribute_values(":expected", AttributeValue::N(expected_version.to_string()))
            .expression_attribute_values(":next", AttributeValue::N((expected_version + 1).to_string()))
            .expression_attribute_values(":pending", AttributeValue::S("pending".into()))
            .return_values(ReturnValue::AllNew);

        for (i, (name, value)) in extra.into_iter().enumerate() {
            let placeholder = format!(":x{i}");
            update.push_str(&format!(", {name} = {placeholder}"));
            req = req.expression_attribute_values(placeholder, value);
        }
        req = req.update_expression(update);

        let out = req.send().await.map_err(|e| {
            let service = e.into_service_error();
            if service.is_conditional_check_failed_exception() {
                ApprovalError::ConcurrentModification
            } else {
                ApprovalError::Backend(service.to_string())
            }
        })?;

        let item = out
            .attributes()
            .ok_or_else(|| ApprovalError::Backend("update returned no attributes".into()))?;
        let request = from_item(item)?;
        tracing::info!(id = %request.id, status = request.status.as_str(), version = request.version, "request transitioned");
        Ok(request)
    }
}

/// 10–1000 characters, printable ASCII.
fn validate_justification(justification: &str) -> Result<(), ApprovalError> {
    let len = justification.chars().count();
    if !(10..=1000).contains(&len) {
        return Err(ApprovalError::Validation(
            "justification must be 10-1000 characters".into(),
        ));
    }
    if !justification.chars().all(|c| c == ' ' || c.is_ascii_graphic()) {
        return Err(ApprovalError::Validation(
            "justification must be printable ASCII".into(),
        ));
    }
    Ok(())
}

/// 16-hex record id.
fn new_request_record_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// 8 lowercase hex chars identifying the approval act.
pub fn new_approval_marker() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

// ── Item codec ─────────────────────────────────────────────────────────

fn to_item(request: &AccessRequest) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::from([
        ("id".to_string(), AttributeValue::S(request.id.clone())),
        ("requester".to_string(), AttributeValue::S(request.requester.clone())),
        ("profile".to_string(), AttributeValue::S(request.profile.clone())),
        (
            "justification".to_string(),
            AttributeValue::S(request.justification.clone()),
        ),
        (
            "duration_seconds".to_string(),
            AttributeValue::N(request.duration_seconds.to_string()),
        ),
        ("status".to_string(), AttributeValue::S(request.status.as_str().into())),
        ("marker".to_string(), AttributeValue::S(request.marker.clone())),
        (
            "approvers_notified".to_string(),
            AttributeValue::L(
                request
                    .approvers_notified
                    .iter()
                    .map(|a| AttributeValue::S(a.clone()))
                    .collect(),
            ),
        ),
        (
            "created_at".to_string(),
            AttributeValue::S(request.created_at.to_rfc3339()),
        ),
        (
            "expires_at".to_string(),
            AttributeValue::S(request.expires_at.to_rfc3339()),
        ),
        (
            "expires_epoch".to_string(),
            AttributeValue::N(request.expires_at.timestamp().to_string()),
        ),
        ("version".to_string(), AttributeValue::N(request.version.to_string())),
    ]);
    if let Some(ref by) = request.approved_by {
        item.insert("approved_by".to_string(), AttributeValue::S(by.clone()));
    }
    if let Some(ref reason) = request.denial_reason {
        item.insert("denial_reason".to_string(), AttributeValue::S(reason.clone()));
    }
    item
}

fn from_item(item: &HashMap<String, AttributeValue>) -> Result<AccessRequest, ApprovalError> {
    let get_s = |name: &str| -> Result<String, ApprovalError> {
        item.get(name)
            .and_then(|v| v.as_s().ok())
            .cloned()
            .ok_or_else(|| ApprovalError::Backend(format!("missing attribute {name}")))
    };
    let get_n = |name: &str| -> Result<i64, ApprovalError> {
        item.get(name)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ApprovalError::Backend(format!("missing attribute {name}")))
    };
    let get_time = |name: &str| -> Result<DateTime<Utc>, ApprovalError> {
        let raw = get_s(name)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ApprovalError::Backend(format!("bad timestamp {name}: {e}")))
    };

    let status_raw = get_s("status")?;
    let status = RequestStatus::parse(&status_raw)
        .ok_or_else(|| ApprovalError::Backend(format!("unknown status {status_raw}")))?;

    Ok(AccessRequest {
        id: get_s("id")?,
        requester: get_s("requester")?,
        profile: get_s("profile")?,
        justification: get_s("justification")?,
        duration_seconds: get_n("duration_seconds")?,
        status,
        marker: get_s("marker")?,
        approved_by: item.get("approved_by").and_then(|v| v.as_s().ok()).cloned(),
        denial_reason: item.get("denial_reason").and_then(|v| v.as_s().ok()).cloned(),
        approvers_notified: item
            .get("approvers_notified")
            .and_then(|v| v.as_l().ok())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_s().ok().cloned())
                    .collect()
            })
            .unwrap_or_default(),
        created_at: get_time("created_at")?,
        expires_at: get_time("expires_at")?,
        version: get_n("version")? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::context::{DecisionContext, Mode};
    use sentinel_core::identity::caller_from_arn;

    fn sample_request(status: RequestStatus) -> AccessRequest {
        AccessRequest {
            id: "00112233aabbccdd".into(),
            requester: "alice".into(),
            profile: "prod".into(),
            justification: "deploying the hotfix for the login outage".into(),
            duration_seconds: 3600,
            status,
            marker: "a1b2c3d4".into(),
            approved_by: None,
            denial_reason: None,
            approvers_notified: vec!["bob".into(), "carol".into()],
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            version: 1,
        }
    }

    #[test]
    fn test_item_round_trip() {
        let request = sample_request(RequestStatus::Pending);
        let item = to_item(&request);
        let back = from_item(&item).unwrap();
        assert_eq!(back.id, request.id);
        assert_eq!(back.requester, request.requester);
        assert_eq!(back.status, RequestStatus::Pending);
        assert_eq!(back.approvers_notified, request.approvers_notified);
        assert_eq!(back.version, 1);
        assert_eq!(back.expires_at.timestamp(), request.expires_at.timestamp());
    }

    #[test]
    fn test_item_round_trip_with_optionals() {
        let mut request = sample_request(RequestStatus::Denied);
        request.approved_by = Some("bob".into());
        request.denial_reason = Some("not during freeze".into());
        let back = from_item(&to_item(&request)).unwrap();
        assert_eq!(back.approved_by.as_deref(), Some("bob"));
        assert_eq!(back.denial_reason.as_deref(), Some("not during freeze"));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Approved,
            RequestStatus::Denied,
            RequestStatus::Expired,
            RequestStatus::Cancelled,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("unknown"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RequestStatus::Pending.is_terminal());
        for status in [
            RequestStatus::Approved,
            RequestStatus::Denied,
            RequestStatus::Expired,
            RequestStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn test_ensure_pending_rejects_terminal() {
        for status in [
            RequestStatus::Approved,
            RequestStatus::Denied,
            RequestStatus::Expired,
            RequestStatus::Cancelled,
        ] {
            let err = sample_request(status).ensure_pending().unwrap_err();
            assert!(matches!(err, ApprovalError::NotPending(_)));
        }
        sample_request(RequestStatus::Pending).ensure_pending().unwrap();
    }

    #[test]
    fn test_marker_visible_only_when_approved() {
        assert_eq!(sample_request(RequestStatus::Pending).visible_marker(), None);
        assert_eq!(
            sample_request(RequestStatus::Approved).visible_marker(),
            Some("a1b2c3d4")
        );
    }

    #[test]
    fn test_marker_format() {
        for _ in 0..32 {
            let marker = new_approval_marker();
            assert_eq!(marker.len(), 8);
            assert!(sentinel_core::source_identity::is_valid_marker(&marker));
        }
    }

    #[test]
    fn test_justification_bounds() {
        assert!(validate_justification("too short").is_err());
        assert!(validate_justification("this one is long enough to count").is_ok());
        assert!(validate_justification(&"x".repeat(1001)).is_err());
        assert!(validate_justification("contains a tab\tcharacter here").is_err());
        assert!(validate_justification("contains ünïcödé characters here").is_err());
    }

    #[test]
    fn test_auto_approve_matching() {
        let rule: AutoApproveRule = serde_yaml::from_str(
            r#"
name: dev-self-service
conditions:
  profiles: [dev]
  users: [alice]
"#,
        )
        .unwrap();

        let caller = caller_from_arn("arn:aws:iam::123456789012:user/alice", None).unwrap();
        let ctx = DecisionContext::new(caller.clone(), "dev", Mode::Cli);
        assert!(conditions_match(&rule.conditions, &ctx));

        let ctx = DecisionContext::new(caller, "prod", Mode::Cli);
        assert!(!conditions_match(&rule.conditions, &ctx));
    }
}
