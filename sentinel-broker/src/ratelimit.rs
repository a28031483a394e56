//! Process-wide and fleet-wide rate limiting.
//!
//! The in-memory fixed window from `sentinel-core` handles the single
//! process case; when a DynamoDB table is configured, counting moves
//! there so every broker instance shares one window per subject. Backend
//! errors fail open: rate limiting is a mitigation, the policy engine is
//! the trust boundary, and an outage in the counter store must not take
//! credential issuance down with it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use aws_sdk_dynamodb::types::AttributeValue;

use sentinel_core::ratelimit::{MemoryRateLimiter, RateLimitConfig, RateLimitDecision};

pub struct BrokerRateLimiter {
    config: RateLimitConfig,
    memory: MemoryRateLimiter,
    distributed: Option<(aws_sdk_dynamodb::Client, String)>,
    fail_open_count: AtomicU64,
}

impl BrokerRateLimiter {
    pub fn new(
        config: RateLimitConfig,
        distributed: Option<(aws_sdk_dynamodb::Client, String)>,
    ) -> Self {
        BrokerRateLimiter {
            config,
            memory: MemoryRateLimiter::new(config),
            distributed,
            fail_open_count: AtomicU64::new(0),
        }
    }

    /// Count one request for `subject`. Uses the shared table when
    /// configured, the in-process window otherwise.
    pub async fn check(&self, subject: &str) -> RateLimitDecision {
        match self.distributed {
            Some((ref db, ref table)) => self.check_distributed(db, table, subject).await,
            None => self.memory.check(subject),
        }
    }

    /// How many times the distributed backend failed and we admitted the
    /// request anyway.
    pub fn fail_open_events(&self) -> u64 {
        self.fail_open_count.load(Ordering::Relaxed)
    }

    async fn check_distributed(
        &self,
        db: &aws_sdk_dynamodb::Client,
        table: &str,
        subject: &str,
    ) -> RateLimitDecision {
        let window_secs = self.config.window.as_secs().max(1);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let window_start = now - now % window_secs;
        let limit = self.config.limit();

        // Step 1: atomic increment inside the current window.
        let increment = db
            .update_item()
            .table_name(table)
            .key("subject", AttributeValue::S(subject.to_string()))
            .update_expression("ADD #c :one")
            .condition_expression("window_start = :ws AND #c < :limit")
            .expression_attribute_names("#c", "count")
            .expression_attribute_values(":one", AttributeValue::N("1".into()))
            .expression_attribute_values(":ws", AttributeValue::N(window_start.to_string()))
            .expression_attribute_values(":limit", AttributeValue::N(limit.to_string()))
            .send()
            .await;

        match increment {
            Ok(_) => return RateLimitDecision::Allowed,
            Err(err) => {
                let service = err.into_service_error();
                if !service.is_conditional_check_failed_exception() {
                    return self.fail_open(subject, &service.to_string());
                }
            }
        }

        // Step 2: the window is stale, the item is missing, or the window
        // is full. Try to start a fresh window; only a *current, full*
        // window survives this condition.
        let reset = db
            .update_item()
            .table_name(table)
            .key("subject", AttributeValue::S(subject.to_string()))
            .update_expression("SET window_start = :ws, #c = :one")
            .condition_expression("attribute_not_exists(window_start) OR window_start < :ws")
            .expression_attribute_names("#c", "count")
            .expression_attribute_values(":one", AttributeValue::N("1".into()))
            .expression_attribute_values(":ws", AttributeValue::N(window_start.to_string()))
            .send()
            .await;

        match reset {
            Ok(_) => RateLimitDecision::Allowed,
            Err(err) => {
                let service = err.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    let retry_after_secs = (window_start + window_secs).saturating_sub(now).max(1);
                    RateLimitDecision::Denied { retry_after_secs }
                } else {
                    self.fail_open(subject, &service.to_string())
                }
            }
        }
    }

    fn fail_open(&self, subject: &str, detail: &str) -> RateLimitDecision {
        self.fail_open_count.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(subject, detail, "rate-limit backend error, admitting request");
        RateLimitDecision::Allowed
    }
}
