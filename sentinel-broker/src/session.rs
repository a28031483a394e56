//! Server-mode session tracking.
//!
//! One record per live server session, optimistic-locked like every other
//! state machine here. `touch` slides the lease forward on each
//! successful vend; `revoke` flips the record so the very next fetch on
//! that session is refused — that is the instant-revocation mechanism.
//! The storage-level TTL sits past `expires_at` so stale records vanish
//! from the indexes even when no sweeper is running.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notify::{LifecycleEvent, Notifier};
use crate::retry::{is_transient_sdk, with_backoff};

/// Extra life the storage TTL gets beyond `expires_at`.
const TTL_SLACK_SECS: i64 = 3600;

/// Default threshold for the `high_profile_count` anomaly flag.
pub const DEFAULT_PROFILE_THRESHOLD: usize = 3;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is {0}, not active")]
    NotActive(String),
    #[error("concurrent modification")]
    ConcurrentModification,
    #[error("session not found")]
    NotFound,
    #[error("store error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Revoked,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Revoked => "revoked",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<SessionStatus> {
        match s {
            "active" => Some(SessionStatus::Active),
            "revoked" => Some(SessionStatus::Revoked),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub source_identity: String,
    pub device_id: Option<String>,
    pub profile: String,
    pub user: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Storage-backend TTL, absolute epoch seconds.
    pub ttl: i64,
    pub version: u64,
}

impl Session {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && self.expires_at > now
    }
}

/// Per-device aggregation for reporting consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceActivity {
    pub distinct_users: usize,
    pub distinct_profiles: usize,
    /// More than one user seen on this device in the window.
    pub multi_user: bool,
    /// Distinct profiles above the configured threshold.
    pub high_profile_count: bool,
}

/// Compute anomaly flags over a query window. Pure so reporting tools can
/// feed it whatever slice they queried.
pub fn device_activity(sessions: &[Session], profile_threshold: usize) -> DeviceActivity {
    let users: HashSet<&str> = sessions.iter().map(|s| s.user.as_str()).collect();
    let profiles: HashSet<&str> = sessions.iter().map(|s| s.profile.as_str()).collect();
    DeviceActivity {
        distinct_users: users.len(),
        distinct_profiles: profiles.len(),
        multi_user: users.len() > 1,
        high_profile_count: profiles.len() > profile_threshold,
    }
}

pub struct SessionTracker {
    db: aws_sdk_dynamodb::Client,
    table: String,
    lease: Duration,
    notifier: Arc<Notifier>,
}

impl SessionTracker {
    pub fn new(
        db: aws_sdk_dynamodb::Client,
        table: impl Into<String>,
        lease: Duration,
        notifier: Arc<Notifier>,
    ) -> Self {
        SessionTracker {
            db,
            table: table.into(),
            lease,
            notifier,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn create(
        &self,
        source_identity: &str,
        device_id: Option<&str>,
        profile: &str,
        user: &str,
        ttl: Duration,
    ) -> Result<Session, SessionError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let session = Session {
            id: hex::encode(rand::random::<[u8; 8]>()),
            source_identity: source_identity.to_string(),
            device_id: device_id.map(str::to_string),
            profile: profile.to_string(),
            user: user.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            last_accessed_at: now,
            expires_at,
            ttl: expires_at.timestamp() + TTL_SLACK_SECS,
            version: 1,
        };

        let db = self.db.clone();
        let table = self.table.clone();
        let item = to_item(&session);
        with_backoff("ddb_put_session", is_transient_sdk, || {
            db.put_item()
                .table_name(&table)
                .set_item(Some(item.clone()))
                .condition_expression("attribute_not_exists(id)")
                .send()
        })
        .await
        .map_err(|e| SessionError::Backend(e.into_service_error().to_string()))?;

        tracing::info!(id = %session.id, user, profile, "session created");
        Ok(session)
    }

    /// Bump `last_accessed_at` and slide the lease. The conditional write
    /// keys on both version and `active`, so `last_accessed_at` is
    /// monotonically non-decreasing and a revoked session can never be
    /// touched back to life.
    pub async fn touch(&self, id: &str, expected_version: u64) -> Result<Session, SessionError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(self.lease).unwrap_or_default();

        let out = self
            .db
            .update_item()
            .table_name(&self.table)
            .key("id", AttributeValue::S(id.to_string()))
            .condition_expression("version = :expected AND #st = :active")
            .update_expression(
                "SET last_accessed_at = :now, expires_at = :exp, expires_epoch = :exp_epoch, #ttl = :ttl, version = :next",
            )
            .expression_attribute_names("#st", "status")
            .expression_attribute_names("#ttl", "ttl")
            .expression_attribute_values(":expected", AttributeValue::N(expected_version.to_string()))
            .expression_attribute_values(":active", AttributeValue::S("active".into()))
            .expression_attribute_values(":now", AttributeValue::S(now.to_rfc3339()))
            .expression_attribute_values(":exp", AttributeValue::S(expires_at.to_rfc3339()))
            .expression_attribute_values(
                ":exp_epoch",
                AttributeValue::N(expires_at.timestamp().to_string()),
            )
            .expression_attribute_values(
                ":ttl",
                AttributeValue::N((expires_at.timestamp() + TTL_SLACK_SECS).to_string()),
            )
            .expression_attribute_values(":next", AttributeValue::N((expected_version + 1).to_string()))
            .return_values(ReturnValue::AllNew)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    SessionError::ConcurrentModification
                } else {
                    SessionError::Backend(service.to_string())
                }
            })?;

        let item = out
            .attributes()
            .ok_or_else(|| SessionError::Backend("update returned no attributes".into()))?;
        from_item(item)
    }

    /// `active → revoked`. Idempotent at `revoked`; revoking an expired
    /// session is refused so the record's final state stays truthful.
    pub async fn revoke(&self, id: &str, actor: &str) -> Result<Session, SessionError> {
        let session = self.lookup(id).await?;
        match session.status {
            SessionStatus::Revoked => return Ok(session),
            SessionStatus::Expired => {
                return Err(SessionError::NotActive("expired".into()));
            }
            SessionStatus::Active => {}
        }

        let out = self
            .db
            .update_item()
            .table_name(&self.table)
            .key("id", AttributeValue::S(id.to_string()))
            .condition_expression("version = :expected AND #st = :active")
            .update_expression("SET #st = :revoked, version = :next")
            .expression_attribute_names("#st", "status")
            .expression_attribute_values(":expected", AttributeValue::N(session.version.to_string()))
            .expression_attribute_values(":active", AttributeValue::S("active".into()))
            .expression_attribute_values(":revoked", AttributeValue::S("revoked".into()))
            .expression_attribute_values(":next", AttributeValue::N((session.version + 1).to_string()))
            .return_values(ReturnValue::AllNew)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    SessionError::ConcurrentModification
                } else {
                    SessionError::Backend(service.to_string())
                }
            })?;

        let item = out
            .attributes()
            .ok_or_else(|| SessionError::Backend("update returned no attributes".into()))?;
        let revoked = from_item(item)?;

        tracing::warn!(id = %revoked.id, actor, "session revoked");
        self.notifier
            .publish(LifecycleEvent::SessionRevoked {
                id: revoked.id.clone(),
                user: revoked.user.clone(),
                profile: revoked.profile.clone(),
                actor: actor.to_string(),
            })
            .await;
        Ok(revoked)
    }

    pub async fn lookup(&self, id: &str) -> Result<Session, SessionError> {
        let db = self.db.clone();
        let table = self.table.clone();
        let out = with_backoff("ddb_get_session", is_transient_sdk, || {
            db.get_item()
                .table_name(&table)
                .key("id", AttributeValue::S(id.to_string()))
                .consistent_read(true)
                .send()
        })
        .await
        .map_err(|e| SessionError::Backend(e.into_service_error().to_string()))?;

        match out.item() {
            Some(item) => from_item(item),
            None => Err(SessionError::NotFound),
        }
    }

    /// Sessions seen for a device over a window, newest first, plus the
    /// anomaly flags reporting tools consume.
    pub async fn query_by_device(
        &self,
        device_id: &str,
        since: Option<DateTime<Utc>>,
        limit: i32,
    ) -> Result<(Vec<Session>, DeviceActivity), SessionError> {
        let sessions = self
            .query_index("by_device", "device_id", device_id, since, limit)
            .await?;
        let activity = device_activity(&sessions, DEFAULT_PROFILE_THRESHOLD);
        Ok((sessions, activity))
    }

    pub async fn query_by_user(
        &self,
        user: &str,
        since: Option<DateTime<Utc>>,
        limit: i32,
    ) -> Result<Vec<Session>, SessionError> {
        self.query_index("by_user", "user", user, since, limit).await
    }

    async fn query_index(
        &self,
        index: &str,
        key_name: &str,
        key_value: &str,
        since: Option<DateTime<Utc>>,
        limit: i32,
    ) -> Result<Vec<Session>, SessionError> {
        let db = self.db.clone();
        let table = self.table.clone();
        let out = with_backoff("ddb_query_sessions", is_transient_sdk, || {
            let mut req = db
                .query()
                .table_name(&table)
                .index_name(index)
                .key_condition_expression("#k = :v")
                .expression_attribute_names("#k", key_name)
                .expression_attribute_values(":v", AttributeValue::S(key_value.to_string()))
                .limit(limit);
            if let Some(since) = since {
                req = req
                    .filter_expression("created_at >= :since")
                    .expression_attribute_values(":since", AttributeValue::S(since.to_rfc3339()));
            }
            req.send()
        })
        .await
        .map_err(|e| SessionError::Backend(e.into_service_error().to_string()))?;

        let mut sessions: Vec<Session> = out
            .items()
            .iter()
            .filter_map(|item| from_item(item).ok())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}

// ── Item codec ─────────────────────────────────────────────────────────

fn to_item(session: &Session) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::from([
        ("id".to_string(), AttributeValue::S(session.id.clone())),
        (
            "source_identity".to_string(),
            AttributeValue::S(session.source_identity.clone()),
        ),
        ("profile".to_string(), AttributeValue::S(session.profile.clone())),
        ("user".to_string(), AttributeValue::S(session.user.clone())),
        ("status".to_string(), AttributeValue::S(session.status.as_str().into())),
        (
            "created_at".to_string(),
            AttributeValue::S(session.created_at.to_rfc3339()),
        ),
        (
            "last_accessed_at".to_string(),
            AttributeValue::S(session.last_accessed_at.to_rfc3339()),
        ),
        (
            "expires_at".to_string(),
            AttributeValue::S(session.expires_at.to_rfc3339()),
        ),
        (
            "expires_epoch".to_string(),
            AttributeValue::N(session.expires_at.timestamp().to_string()),
        ),
        ("ttl".to_string(), AttributeValue::N(session.ttl.to_string())),
        ("version".to_string(), AttributeValue::N(session.version.to_string())),
    ]);
    if let Some(ref device_id) = session.device_id {
        item.insert("device_id".to_string(), AttributeValue::S(device_id.clone()));
    }
    item
}

fn from_item(item: &HashMap<String, AttributeValue>) -> Result<Session, SessionError> {
    let get_s = |name: &str| -> Result<String, SessionError> {
        item.get(name)
            .and_then(|v| v.as_s().ok())
            .cloned()
            .ok_or_else(|| SessionError::Backend(format!("missing attribute {name}")))
    };
    let get_n = |name: &str| -> Result<i64, SessionError> {
        item.get(name)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| SessionError::Backend(format!("missing attribute {name}")))
    };
    let get_time = |name: &str| -> Result<DateTime<Utc>, SessionError> {
        let raw = get_s(name)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| SessionError::Backend(format!("bad timestamp {name}: {e}")))
    };

    let status_raw = get_s("status")?;
    Ok(Session {
        id: get_s("id")?,
        source_identity: get_s("source_identity")?,
        device_id: item.get("device_id").and_then(|v| v.as_s().ok()).cloned(),
        profile: get_s("profile")?,
        user: get_s("user")?,
        status: SessionStatus::parse(&status_raw)
            .ok_or_else(|| SessionError::Backend(format!("unknown status {status_raw}")))?,
        created_at: get_time("created_at")?,
        last_accessed_at: get_time("last_accessed_at")?,
        expires_at: get_time("expires_at")?,
        ttl: get_n("ttl")?,
        version: get_n("version")? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(user: &str, profile: &str) -> Session {
        let now = Utc::now();
        Session {
            id: hex::encode(rand::random::<[u8; 8]>()),
            source_identity: format!("sentinel:{user}:direct:a1b2c3d4"),
            device_id: Some("ab".repeat(16)),
            profile: profile.to_string(),
            user: user.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            last_accessed_at: now,
            expires_at: now + chrono::Duration::minutes(15),
            ttl: now.timestamp() + 900 + TTL_SLACK_SECS,
            version: 1,
        }
    }

    #[test]
    fn test_item_round_trip() {
        let session = sample("alice", "dev");
        let back = from_item(&to_item(&session)).unwrap();
        assert_eq!(back.id, session.id);
        assert_eq!(back.source_identity, session.source_identity);
        assert_eq!(back.device_id, session.device_id);
        assert_eq!(back.status, SessionStatus::Active);
        assert_eq!(back.ttl, session.ttl);
    }

    #[test]
    fn test_item_round_trip_without_device() {
        let mut session = sample("alice", "dev");
        session.device_id = None;
        let back = from_item(&to_item(&session)).unwrap();
        assert_eq!(back.device_id, None);
    }

    #[test]
    fn test_ttl_sits_past_expiry() {
        let session = sample("alice", "dev");
        assert!(session.ttl > session.expires_at.timestamp());
    }

    #[test]
    fn test_is_live() {
        let now = Utc::now();
        let mut session = sample("alice", "dev");
        assert!(session.is_live(now));

        session.status = SessionStatus::Revoked;
        assert!(!session.is_live(now));

        session.status = SessionStatus::Active;
        session.expires_at = now - chrono::Duration::seconds(1);
        assert!(!session.is_live(now));
    }

    #[test]
    fn test_device_activity_single_user() {
        let sessions = vec![sample("alice", "dev"), sample("alice", "dev")];
        let activity = device_activity(&sessions, DEFAULT_PROFILE_THRESHOLD);
        assert_eq!(activity.distinct_users, 1);
        assert_eq!(activity.distinct_profiles, 1);
        assert!(!activity.multi_user);
        assert!(!activity.high_profile_count);
    }

    #[test]
    fn test_device_activity_multi_user_flag() {
        let sessions = vec![sample("alice", "dev"), sample("bob", "dev")];
        let activity = device_activity(&sessions, DEFAULT_PROFILE_THRESHOLD);
        assert_eq!(activity.distinct_users, 2);
        assert!(activity.multi_user);
    }

    #[test]
    fn test_device_activity_high_profile_flag() {
        let sessions = vec![
            sample("alice", "dev"),
            sample("alice", "staging"),
            sample("alice", "prod"),
            sample("alice", "audit"),
        ];
        let activity = device_activity(&sessions, 3);
        assert_eq!(activity.distinct_profiles, 4);
        assert!(activity.high_profile_count);
        assert!(!activity.multi_user);
    }

    #[test]
    fn test_device_activity_empty_window() {
        let activity = device_activity(&[], DEFAULT_PROFILE_THRESHOLD);
        assert_eq!(activity.distinct_users, 0);
        assert!(!activity.multi_user);
        assert!(!activity.high_profile_count);
    }
}
