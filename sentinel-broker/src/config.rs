//! Broker configuration.
//!
//! Environment-driven with defaults, the same shape as every deployable in
//! this codebase: read once at startup, clone freely, no re-reads.

use std::collections::HashMap;
use std::time::Duration;

use sentinel_core::ratelimit::RateLimitConfig;

/// Posture-provider failure disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Provider errors deny any rule with a device condition.
    Closed,
    /// Provider errors substitute an unknown posture and let rules decide.
    Open,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Parameter-store root, e.g. `/sentinel`. Policies live at
    /// `{root}/policies/{profile}`, signatures at
    /// `{root}/signatures/{profile}`, role ARNs at `{root}/roles/{profile}`.
    pub parameter_root: String,
    /// Require a valid signature on every policy. When off, unsigned
    /// policies are admitted but invalid signatures still fail.
    pub enforce_signatures: bool,
    /// KMS key used to verify policy signatures.
    pub signing_key_id: String,
    /// Policy / role-mapping cache TTL.
    pub policy_cache_ttl: Duration,

    /// DynamoDB table names.
    pub approvals_table: String,
    pub breakglass_table: String,
    pub sessions_table: Option<String>,
    pub ratelimit_table: Option<String>,

    /// Access-request lifetime and caps.
    pub request_ttl: Duration,
    pub max_request_duration: Duration,
    /// Approvers per profile; the `*` entry applies to profiles without
    /// their own list.
    pub approvers: HashMap<String, Vec<String>>,

    /// Break-glass caps and authorization.
    pub breakglass_max_duration: Duration,
    pub breakglass_users: HashMap<String, Vec<String>>,

    /// MDM provider endpoint and disposition.
    pub mdm_url: Option<String>,
    /// Secrets Manager id holding the MDM bearer token.
    pub mdm_token_secret_id: String,
    pub mdm_fail_mode: FailMode,
    pub posture_cache_ttl: Duration,
    pub mdm_token_cache_ttl: Duration,

    /// Vend limits.
    pub vend_limit: RateLimitConfig,
    /// Server-mode sessions default to short leases.
    pub server_default_duration: Duration,
    pub default_duration: Duration,
    pub max_duration: Duration,
    /// Sliding lease window applied by session `touch`.
    pub session_lease: Duration,

    /// Audit-log HMAC key.
    pub audit_key: Vec<u8>,

    /// Notification sinks.
    pub sns_topic_arn: Option<String>,
    pub webhook_urls: Vec<String>,
}

impl BrokerConfig {
    /// Build from environment variables with defaults. Only called from
    /// binaries; libraries take the struct.
    pub fn from_env() -> Self {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let env_or = |key: &str, default: &str| {
            std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.into())
        };
        let secs = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(default))
        };

        BrokerConfig {
            parameter_root: env_or("SENTINEL_PARAMETER_ROOT", "/sentinel"),
            enforce_signatures: env_or("SENTINEL_ENFORCE_SIGNATURES", "1") == "1",
            signing_key_id: env_or("SENTINEL_SIGNING_KEY_ID", "alias/sentinel-policy"),
            policy_cache_ttl: secs("SENTINEL_POLICY_CACHE_TTL", 300),

            approvals_table: env_or("SENTINEL_APPROVALS_TABLE", "sentinel-approvals"),
            breakglass_table: env_or("SENTINEL_BREAKGLASS_TABLE", "sentinel-breakglass"),
            sessions_table: env("SENTINEL_SESSION_TABLE"),
            ratelimit_table: env("SENTINEL_RATELIMIT_TABLE"),

            request_ttl: secs("SENTINEL_REQUEST_TTL", 3600),
            max_request_duration: secs("SENTINEL_MAX_REQUEST_DURATION", 4 * 3600),
            approvers: parse_subject_map(env("SENTINEL_APPROVERS").as_deref().unwrap_or("")),

            breakglass_max_duration: secs("SENTINEL_BREAKGLASS_MAX_DURATION", 4 * 3600),
            breakglass_users: parse_subject_map(
                env("SENTINEL_BREAKGLASS_USERS").as_deref().unwrap_or(""),
            ),

            mdm_url: env("SENTINEL_MDM_URL"),
            mdm_token_secret_id: env_or("SENTINEL_MDM_TOKEN_SECRET", "sentinel/mdm-token"),
            mdm_fail_mode: if env_or("SENTINEL_MDM_FAIL_OPEN", "0") == "1" {
                FailMode::Open
            } else {
                FailMode::Closed
            },
            posture_cache_ttl: secs("SENTINEL_POSTURE_CACHE_TTL", 300),
            mdm_token_cache_ttl: secs("SENTINEL_MDM_TOKEN_CACHE_TTL", 3600),

            vend_limit: RateLimitConfig::default(),
            server_default_duration: secs("SENTINEL_SERVER_DEFAULT_DURATION", 900),
            default_duration: secs("SENTINEL_DEFAULT_DURATION", 3600),
            max_duration: secs("SENTINEL_MAX_DURATION", 12 * 3600),
            session_lease: secs("SENTINEL_SESSION_LEASE", 900),

            audit_key: env_or("SENTINEL_AUDIT_KEY", "sentinel-audit-dev-key").into_bytes(),

            sns_topic_arn: env("SENTINEL_SNS_TOPIC"),
            webhook_urls: env("SENTINEL_WEBHOOKS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
        }
    }

    /// Approvers for a profile, falling back to the `*` entry.
    pub fn approvers_for(&self, profile: &str) -> &[String] {
        self.approvers
            .get(profile)
            .or_else(|| self.approvers.get("*"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Break-glass authorized users for a profile, `*` fallback.
    pub fn breakglass_users_for(&self, profile: &str) -> &[String] {
        self.breakglass_users
            .get(profile)
            .or_else(|| self.breakglass_users.get("*"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Parse `profile=user1|user2;other=user3` into a map. The `*` profile is
/// the fallback entry.
fn parse_subject_map(raw: &str) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    for entry in raw.split(';') {
        let Some((profile, users)) = entry.split_once('=') else {
            continue;
        };
        let users: Vec<String> = users
            .split('|')
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if !users.is_empty() {
            map.insert(profile.trim().to_string(), users);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subject_map() {
        let map = parse_subject_map("prod=bob|carol;*=ops-lead");
        assert_eq!(map["prod"], vec!["bob", "carol"]);
        assert_eq!(map["*"], vec!["ops-lead"]);
    }

    #[test]
    fn test_parse_subject_map_ignores_garbage() {
        let map = parse_subject_map("noequals;=nousers;ok=alice");
        assert_eq!(map.len(), 1);
        assert_eq!(map["ok"], vec!["alice"]);
    }

    #[test]
    fn test_approvers_fallback() {
        let mut config = BrokerConfig::from_env();
        config.approvers = parse_subject_map("prod=bob;*=lead");
        assert_eq!(config.approvers_for("prod"), ["bob".to_string()]);
        assert_eq!(config.approvers_for("dev"), ["lead".to_string()]);
    }
}
