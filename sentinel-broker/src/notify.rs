//! Lifecycle notification fan-out.
//!
//! Fire-and-forget by contract: every configured sink is attempted
//! independently, failures are logged, and nothing here ever blocks or
//! fails the operation that produced the event.

use serde::Serialize;
use serde_json::json;

/// The transitions observers care about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    RequestSubmitted {
        id: String,
        requester: String,
        profile: String,
        expires_at: String,
    },
    RequestApproved {
        id: String,
        approver: String,
        profile: String,
    },
    BreakGlassInvoked {
        id: String,
        invoker: String,
        profile: String,
        reason_code: String,
        expires_at: String,
    },
    SessionRevoked {
        id: String,
        user: String,
        profile: String,
        actor: String,
    },
}

impl LifecycleEvent {
    /// Subject line for topic sinks.
    pub fn subject(&self) -> String {
        match self {
            LifecycleEvent::RequestSubmitted { requester, profile, .. } => {
                format!("[sentinel] access request: {requester} -> {profile}")
            }
            LifecycleEvent::RequestApproved { id, approver, .. } => {
                format!("[sentinel] request {id} approved by {approver}")
            }
            LifecycleEvent::BreakGlassInvoked { invoker, profile, .. } => {
                format!("[sentinel] BREAK-GLASS: {invoker} -> {profile}")
            }
            LifecycleEvent::SessionRevoked { id, .. } => {
                format!("[sentinel] session {id} revoked")
            }
        }
    }
}

pub struct Notifier {
    sns: Option<(aws_sdk_sns::Client, String)>,
    webhooks: Vec<String>,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(sns: Option<(aws_sdk_sns::Client, String)>, webhooks: Vec<String>) -> Self {
        Notifier {
            sns,
            webhooks,
            http: reqwest::Client::new(),
        }
    }

    /// A notifier with no sinks; publish becomes a no-op.
    pub fn disabled() -> Self {
        Notifier::new(None, Vec::new())
    }

    /// Deliver to every sink. Each sink is attempted even when earlier
    /// ones fail; nothing propagates to the caller.
    pub async fn publish(&self, event: LifecycleEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(%err, "could not serialize lifecycle event");
                return;
            }
        };

        if let Some((ref sns, ref topic_arn)) = self.sns {
            let result = sns
                .publish()
                .topic_arn(topic_arn)
                .subject(event.subject())
                .message(&payload)
                .send()
                .await;
            if let Err(err) = result {
                tracing::warn!(err = %err.into_service_error(), "sns publish failed");
            }
        }

        for url in &self.webhooks {
            let result = self
                .http
                .post(url)
                .json(&json!({ "subject": event.subject(), "body": event }))
                .send()
                .await;
            match result {
                Ok(resp) if !resp.status().is_success() => {
                    tracing::warn!(url, status = %resp.status(), "webhook rejected event");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(url, %err, "webhook delivery failed");
                }
            }
        }
    }
}
