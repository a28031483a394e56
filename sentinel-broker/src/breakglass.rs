//! Break-glass: audited emergency bypass.
//!
//! An active break-glass event lets its invoker mint credentials for a
//! profile the policy would otherwise gate, in exchange for a mandatory
//! justification, a hard duration cap, a rate limit, and a loud
//! notification. Events carry a `bg`-prefixed marker so every resulting
//! session is distinguishable in CloudTrail.
//!
//! States: `active → {closed, expired}`, both terminal.

use std::collections::HashMap;
use std::sync::Arc;

use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sentinel_core::context::DecisionContext;

use crate::notify::{LifecycleEvent, Notifier};
use crate::ratelimit::BrokerRateLimiter;
use crate::retry::{is_transient_sdk, with_backoff};

/// Hard ceiling on any break-glass duration.
pub const MAX_BREAKGLASS_SECONDS: i64 = 4 * 3600;

#[derive(Debug, Error)]
pub enum BreakGlassError {
    #[error("event is {0}, not active")]
    NotActive(String),
    #[error("concurrent modification")]
    ConcurrentModification,
    #[error("{0} is not authorized for break-glass on this profile")]
    NotAuthorized(String),
    #[error("only the invoker or a privileged closer may close")]
    NotCloser,
    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("invalid invocation: {0}")]
    Validation(String),
    #[error("event not found")]
    NotFound,
    #[error("store error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakGlassStatus {
    Active,
    Closed,
    Expired,
}

impl BreakGlassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakGlassStatus::Active => "active",
            BreakGlassStatus::Closed => "closed",
            BreakGlassStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<BreakGlassStatus> {
        match s {
            "active" => Some(BreakGlassStatus::Active),
            "closed" => Some(BreakGlassStatus::Closed),
            "expired" => Some(BreakGlassStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Incident,
    Maintenance,
    Security,
    Recovery,
    Other,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Incident => "incident",
            ReasonCode::Maintenance => "maintenance",
            ReasonCode::Security => "security",
            ReasonCode::Recovery => "recovery",
            ReasonCode::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<ReasonCode> {
        match s {
            "incident" => Some(ReasonCode::Incident),
            "maintenance" => Some(ReasonCode::Maintenance),
            "security" => Some(ReasonCode::Security),
            "recovery" => Some(ReasonCode::Recovery),
            "other" => Some(ReasonCode::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakGlassEvent {
    pub id: String,
    pub invoker: String,
    pub profile: String,
    pub reason_code: ReasonCode,
    pub justification: String,
    pub duration_seconds: i64,
    pub status: BreakGlassStatus,
    /// `bg` + 6 lowercase hex; stamped into the SourceIdentity.
    pub marker: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct BreakGlassSettings {
    /// Policy cap; clamped to `MAX_BREAKGLASS_SECONDS` regardless.
    pub max_duration_seconds: i64,
    /// Authorized invokers per profile; `*` is the fallback entry.
    pub authorized_users: HashMap<String, Vec<String>>,
    /// Usernames allowed to close events they did not invoke.
    pub privileged_closers: Vec<String>,
}

impl BreakGlassSettings {
    fn users_for(&self, profile: &str) -> &[String] {
        self.authorized_users
            .get(profile)
            .or_else(|| self.authorized_users.get("*"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn effective_cap(&self) -> i64 {
        self.max_duration_seconds.min(MAX_BREAKGLASS_SECONDS)
    }
}

pub struct BreakGlassStore {
    db: aws_sdk_dynamodb::Client,
    table: String,
    settings: BreakGlassSettings,
    limiter: Arc<BrokerRateLimiter>,
    notifier: Arc<Notifier>,
}

impl BreakGlassStore {
    pub fn new(
        db: aws_sdk_dynamodb::Client,
        table: impl Into<String>,
        settings: BreakGlassSettings,
        limiter: Arc<BrokerRateLimiter>,
        notifier: Arc<Notifier>,
    ) -> Self {
        BreakGlassStore {
            db,
            table: table.into(),
            settings,
            limiter,
            notifier,
        }
    }

    /// Gate, create, and announce an emergency event.
    pub async fn invoke(
        &self,
        ctx: &DecisionContext,
        reason_code: ReasonCode,
        justification: &str,
        duration_seconds: i64,
    ) -> Result<BreakGlassEvent, BreakGlassError> {
        let user = &ctx.caller.sanitized_username;

        validate_justification(justification)?;
        let cap = self.settings.effective_cap();
        if duration_seconds <= 0 || duration_seconds > cap {
            return Err(BreakGlassError::Validation(format!(
                "duration must be 1..={cap} seconds"
            )));
        }
        if !self.settings.users_for(&ctx.profile).iter().any(|u| u == user) {
            return Err(BreakGlassError::NotAuthorized(user.clone()));
        }
        let subject = format!("{user}:{}", ctx.profile);
        if let sentinel_core::ratelimit::RateLimitDecision::Denied { retry_after_secs } =
            self.limiter.check(&subject).await
        {
            return Err(BreakGlassError::RateLimited { retry_after_secs });
        }

        let now = Utc::now();
        let event = BreakGlassEvent {
            id: hex::encode(rand::random::<[u8; 8]>()),
            invoker: user.clone(),
            profile: ctx.profile.clone(),
            reason_code,
            justification: justification.to_string(),
            duration_seconds,
            status: BreakGlassStatus::Active,
            marker: new_breakglass_marker(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(duration_seconds),
            closed_at: None,
            version: 1,
        };

        let db = self.db.clone();
        let table = self.table.clone();
        let item = to_item(&event);
        with_backoff("ddb_put_breakglass", is_transient_sdk, || {
            db.put_item()
                .table_name(&table)
                .set_item(Some(item.clone()))
                .condition_expression("attribute_not_exists(id)")
                .send()
        })
        .await
        .map_err(|e| BreakGlassError::Backend(e.into_service_error().to_string()))?;

        tracing::warn!(
            id = %event.id,
            invoker = %event.invoker,
            profile = %event.profile,
            reason = event.reason_code.as_str(),
            "BREAK-GLASS invoked"
        );
        self.notifier
            .publish(LifecycleEvent::BreakGlassInvoked {
                id: event.id.clone(),
                invoker: event.invoker.clone(),
                profile: event.profile.clone(),
                reason_code: event.reason_code.as_str().to_string(),
                expires_at: event.expires_at.to_rfc3339(),
            })
            .await;

        Ok(event)
    }

    /// `active → closed`. Restricted to the invoker or a privileged
    /// closer. Idempotent at `closed`: closing a closed event is a no-op
    /// success.
    pub async fn close(
        &self,
        id: &str,
        actor: &str,
        expected_version: u64,
    ) -> Result<BreakGlassEvent, BreakGlassError> {
        let event = self.get(id).await?;
        if event.status == BreakGlassStatus::Closed {
            return Ok(event);
        }
        if event.status != BreakGlassStatus::Active {
            return Err(BreakGlassError::NotActive(event.status.as_str().into()));
        }
        if actor != event.invoker && !self.settings.privileged_closers.iter().any(|c| c == actor) {
            return Err(BreakGlassError::NotCloser);
        }
        self.transition(id, expected_version, BreakGlassStatus::Closed, true)
            .await
    }

    pub async fn get(&self, id: &str) -> Result<BreakGlassEvent, BreakGlassError> {
        let db = self.db.clone();
        let table = self.table.clone();
        let out = with_backoff("ddb_get_breakglass", is_transient_sdk, || {
            db.get_item()
                .table_name(&table)
                .key("id", AttributeValue::S(id.to_string()))
                .consistent_read(true)
                .send()
        })
        .await
        .map_err(|e| BreakGlassError::Backend(e.into_service_error().to_string()))?;

        match out.item() {
            Some(item) => from_item(item),
            None => Err(BreakGlassError::NotFound),
        }
    }

    /// The marker of the caller's live event for this profile, if any.
    /// Consulted by the vend pipeline when the policy alone would refuse.
    pub async fn active_marker(
        &self,
        user: &str,
        profile: &str,
    ) -> Result<Option<String>, BreakGlassError> {
        let db = self.db.clone();
        let table = self.table.clone();
        let out = with_backoff("ddb_query_breakglass", is_transient_sdk, || {
            db.query()
                .table_name(&table)
                .index_name("by_invoker")
                .key_condition_expression("invoker = :u")
                .filter_expression("#st = :active AND profile = :p AND expires_epoch > :now")
                .expression_attribute_names("#st", "status")
                .expression_attribute_values(":u", AttributeValue::S(user.to_string()))
                .expression_attribute_values(":active", AttributeValue::S("active".into()))
                .expression_attribute_values(":p", AttributeValue::S(profile.to_string()))
                .expression_attribute_values(
                    ":now",
                    AttributeValue::N(Utc::now().timestamp().to_string()),
                )
                .send()
        })
        .await
        .map_err(|e| BreakGlassError::Backend(e.into_service_error().to_string()))?;

        let mut events: Vec<BreakGlassEvent> = out
            .items()
            .iter()
            .filter_map(|item| from_item(item).ok())
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events.into_iter().next().map(|e| e.marker))
    }

    /// Transition lapsed `active` events to `expired`. Idempotent.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> Result<u32, BreakGlassError> {
        let db = self.db.clone();
        let table = self.table.clone();
        let out = with_backoff("ddb_scan_breakglass", is_transient_sdk, || {
            db.scan()
                .table_name(&table)
                .filter_expression("#st = :active AND expires_epoch < :now")
                .expression_attribute_names("#st", "status")
                .expression_attribute_values(":active", AttributeValue::S("active".into()))
                .expression_attribute_values(":now", AttributeValue::N(now.timestamp().to_string()))
                .send()
        })
        .await
        .map_err(|e| BreakGlassError::Backend(e.into_service_error().to_string()))?;

        let mut expired = 0;
        for item in out.items() {
            let Ok(event) = from_item(item) else {
                continue;
            };
            match self
                .transition(&event.id, event.version, BreakGlassStatus::Expired, false)
                .await
            {
                Ok(_) => expired += 1,
                Err(BreakGlassError::ConcurrentModification) => {}
                Err(err) => {
                    tracing::warn!(id = %event.id, %err, "break-glass sweep skipped a record");
                }
            }
        }
        Ok(expired)
    }

    async fn transition(
        &self,
        id: &str,
        expected_version: u64,
        to: BreakGlassStatus,
        set_closed_at: bool,
    ) -> Result<BreakGlassEvent, BreakGlassError> {
        let mut update = String::from("SET #st = :to, version = :next");
        let mut req = self
            .db
            .update_item()
            .table_name(&self.table)
            .key("id", AttributeValue::S(id.to_string()))
            .condition_expression("version = :expected AND #st = :active")
            .expression_attribute_names("#st", "status")
            .expression_attribute_values(":to", AttributeValue::S(to.as_str().into()))
            .expression_attribute_values(":expected", AttributeValue::N(expected_version.to_string()))
            .expression_attribute_values(":next", AttributeValue::N((expected_version + 1).to_string()))
            .expression_attribute_values(":active", AttributeValue::S("active".into()))
            .return_values(ReturnValue::AllNew);
        if set_closed_at {
            update.push_str(", closed_at = :closed");
            req = req.expression_attribute_values(
                ":closed",
                AttributeValue::S(Utc::now().to_rfc3339()),
            );
        }

        let out = req.update_expression(update).send().await.map_err(|e| {
            let service = e.into_service_error();
            if service.is_conditional_check_failed_exception() {
                BreakGlassError::ConcurrentModification
            } else {
                BreakGlassError::Backend(service.to_string())
            }
        })?;

        let item = out
            .attributes()
            .ok_or_else(|| BreakGlassError::Backend("update returned no attributes".into()))?;
        from_item(item)
    }
}

/// 20–1000 characters, printable ASCII. The floor is deliberate: "fixing"
/// is not a justification.
fn validate_justification(justification: &str) -> Result<(), BreakGlassError> {
    let len = justification.chars().count();
    if !(20..=1000).contains(&len) {
        return Err(BreakGlassError::Validation(
            "justification must be 20-1000 characters".into(),
        ));
    }
    if !justification.chars().all(|c| c == ' ' || c.is_ascii_graphic()) {
        return Err(BreakGlassError::Validation(
            "justification must be printable ASCII".into(),
        ));
    }
    Ok(())
}

/// `bg` + 6 lowercase hex.
pub fn new_breakglass_marker() -> String {
    format!("bg{}", hex::encode(rand::random::<[u8; 3]>()))
}

// ── Item codec ─────────────────────────────────────────────────────────

fn to_item(event: &BreakGlassEvent) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::from([
        ("id".to_string(), AttributeValue::S(event.id.clone())),
        ("invoker".to_string(), AttributeValue::S(event.invoker.clone())),
        ("profile".to_string(), AttributeValue::S(event.profile.clone())),
        (
            "reason_code".to_string(),
            AttributeValue::S(event.reason_code.as_str().into()),
        ),
        (
            "justification".to_string(),
            AttributeValue::S(event.justification.clone()),
        ),
        (
            "duration_seconds".to_string(),
            AttributeValue::N(event.duration_seconds.to_string()),
        ),
        ("status".to_string(), AttributeValue::S(event.status.as_str().into())),
        ("marker".to_string(), AttributeValue::S(event.marker.clone())),
        (
            "created_at".to_string(),
            AttributeValue::S(event.created_at.to_rfc3339()),
        ),
        (
            "expires_at".to_string(),
            AttributeValue::S(event.expires_at.to_rfc3339()),
        ),
        (
            "expires_epoch".to_string(),
            AttributeValue::N(event.expires_at.timestamp().to_string()),
        ),
        ("version".to_string(), AttributeValue::N(event.version.to_string())),
    ]);
    if let Some(closed_at) = event.closed_at {
        item.insert(
            "closed_at".to_string(),
            AttributeValue::S(closed_at.to_rfc3339()),
        );
    }
    item
}

fn from_item(item: &HashMap<String, AttributeValue>) -> Result<BreakGlassEvent, BreakGlassError> {
    let get_s = |name: &str| -> Result<String, BreakGlassError> {
        item.get(name)
            .and_then(|v| v.as_s().ok())
            .cloned()
            .ok_or_else(|| BreakGlassError::Backend(format!("missing attribute {name}")))
    };
    let get_n = |name: &str| -> Result<i64, BreakGlassError> {
        item.get(name)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| BreakGlassError::Backend(format!("missing attribute {name}")))
    };
    let get_time = |name: &str| -> Result<DateTime<Utc>, BreakGlassError> {
        let raw = get_s(name)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| BreakGlassError::Backend(format!("bad timestamp {name}: {e}")))
    };

    let status_raw = get_s("status")?;
    let reason_raw = get_s("reason_code")?;

    Ok(BreakGlassEvent {
        id: get_s("id")?,
        invoker: get_s("invoker")?,
        profile: get_s("profile")?,
        reason_code: ReasonCode::parse(&reason_raw)
            .ok_or_else(|| BreakGlassError::Backend(format!("unknown reason {reason_raw}")))?,
        justification: get_s("justification")?,
        duration_seconds: get_n("duration_seconds")?,
        status: BreakGlassStatus::parse(&status_raw)
            .ok_or_else(|| BreakGlassError::Backend(format!("unknown status {status_raw}")))?,
        marker: get_s("marker")?,
        created_at: get_time("created_at")?,
        expires_at: get_time("expires_at")?,
        closed_at: item
            .get("closed_at")
            .and_then(|v| v.as_s().ok())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
        version: get_n("version")? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: BreakGlassStatus) -> BreakGlassEvent {
        let now = Utc::now();
        BreakGlassEvent {
            id: "feedfacecafebeef".into(),
            invoker: "alice".into(),
            profile: "prod".into(),
            reason_code: ReasonCode::Incident,
            justification: "database failover stuck, need prod access now".into(),
            duration_seconds: 3600,
            status,
            marker: "bga1b2c3".into(),
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
            closed_at: None,
            version: 1,
        }
    }

    #[test]
    fn test_item_round_trip() {
        let event = sample(BreakGlassStatus::Active);
        let back = from_item(&to_item(&event)).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.reason_code, ReasonCode::Incident);
        assert_eq!(back.status, BreakGlassStatus::Active);
        assert_eq!(back.marker, "bga1b2c3");
        assert_eq!(back.closed_at, None);
    }

    #[test]
    fn test_item_round_trip_closed() {
        let mut event = sample(BreakGlassStatus::Closed);
        event.closed_at = Some(Utc::now());
        let back = from_item(&to_item(&event)).unwrap();
        assert!(back.closed_at.is_some());
    }

    #[test]
    fn test_marker_format() {
        for _ in 0..32 {
            let marker = new_breakglass_marker();
            assert_eq!(marker.len(), 8);
            assert!(marker.starts_with("bg"));
            assert!(sentinel_core::source_identity::is_valid_marker(&marker));
        }
    }

    #[test]
    fn test_reason_codes_round_trip() {
        for reason in [
            ReasonCode::Incident,
            ReasonCode::Maintenance,
            ReasonCode::Security,
            ReasonCode::Recovery,
            ReasonCode::Other,
        ] {
            assert_eq!(ReasonCode::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(ReasonCode::parse("panic"), None);
    }

    #[test]
    fn test_justification_floor_and_ceiling() {
        assert!(validate_justification("too short").is_err());
        assert!(validate_justification("database failover stuck, need access").is_ok());
        assert!(validate_justification(&"x".repeat(1001)).is_err());
        assert!(validate_justification(&"x".repeat(1000)).is_ok());
        assert!(validate_justification("newline\nin justification here").is_err());
    }

    #[test]
    fn test_settings_cap_clamped_to_four_hours() {
        let settings = BreakGlassSettings {
            max_duration_seconds: 24 * 3600,
            authorized_users: HashMap::new(),
            privileged_closers: vec![],
        };
        assert_eq!(settings.effective_cap(), MAX_BREAKGLASS_SECONDS);
    }

    #[test]
    fn test_settings_users_fallback() {
        let settings = BreakGlassSettings {
            max_duration_seconds: 3600,
            authorized_users: HashMap::from([
                ("prod".to_string(), vec!["alice".to_string()]),
                ("*".to_string(), vec!["oncall".to_string()]),
            ]),
            privileged_closers: vec![],
        };
        assert_eq!(settings.users_for("prod"), ["alice".to_string()]);
        assert_eq!(settings.users_for("dev"), ["oncall".to_string()]);
    }
}
