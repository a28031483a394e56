//! Caller identity extraction.
//!
//! Resolves an AWS ARN into a sanitized `Caller`. This is the single entry
//! point for identity on every path — the one-shot vend and the local
//! server share this function, so an ARN always maps to the same caller.
//!
//! Deterministic and pure: no I/O, no clock, no randomness.

use serde::{Deserialize, Serialize};

use crate::error::VendError;

/// Partitions we will accept in an ARN. Anything else is rejected outright.
const KNOWN_PARTITIONS: &[&str] = &["aws", "aws-cn", "aws-us-gov", "aws-iso", "aws-iso-b"];

/// Maximum length of a sanitized username. Matches the headroom left for the
/// other SourceIdentity segments.
const MAX_USERNAME_LEN: usize = 64;

/// The resolved caller. Immutable after construction; the pipeline passes
/// it through by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// The full original ARN. Internal use only — never reaches a client.
    pub arn: String,
    /// 12-digit account id from the ARN.
    pub account_id: String,
    /// Partition (`aws`, `aws-cn`, ...).
    pub partition: String,
    /// Username after sanitization: only `[A-Za-z0-9_-]`, non-empty, ≤ 64.
    pub sanitized_username: String,
    /// Device identifier supplied by the client, if any. 32 lowercase hex
    /// chars when present (validated at the posture boundary, not here).
    pub device_id: Option<String>,
}

/// Parse an ARN into a `Caller`.
///
/// Accepted resource shapes:
/// - `user/<path...>/<name>` (IAM user; trailing segment is the name)
/// - `assumed-role/<role>/<session>` (session name is the identity)
/// - `role/<name>`
pub fn caller_from_arn(arn: &str, device_id: Option<String>) -> Result<Caller, VendError> {
    let mut parts = arn.splitn(6, ':');
    let prefix = parts.next().unwrap_or_default();
    let partition = parts.next().unwrap_or_default();
    let service = parts.next().unwrap_or_default();
    let _region = parts.next().unwrap_or_default();
    let account_id = parts.next().unwrap_or_default();
    let resource = parts.next().unwrap_or_default();

    if prefix != "arn" {
        return Err(VendError::InvalidIdentity(format!("not an ARN: {arn}")));
    }
    if !KNOWN_PARTITIONS.contains(&partition) {
        return Err(VendError::InvalidIdentity(format!(
            "unknown partition {partition:?} in {arn}"
        )));
    }
    if service != "iam" && service != "sts" {
        return Err(VendError::InvalidIdentity(format!(
            "unsupported service {service:?} in {arn}"
        )));
    }
    if account_id.len() != 12 || !account_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VendError::InvalidIdentity(format!(
            "malformed account id in {arn}"
        )));
    }

    validate_resource(resource, arn)?;

    let (kind, rest) = resource
        .split_once('/')
        .ok_or_else(|| VendError::InvalidIdentity(format!("bare resource in {arn}")))?;

    let raw_name = match kind {
        // IAM users can carry a path; the trailing segment is the name.
        "user" => rest
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VendError::InvalidIdentity(format!("empty user name in {arn}")))?,
        // assumed-role/<role>/<session> — the session name is the identity.
        "assumed-role" => {
            let mut segs = rest.split('/');
            let role = segs.next().unwrap_or_default();
            let session = segs.next().unwrap_or_default();
            if role.is_empty() || session.is_empty() || segs.next().is_some() {
                return Err(VendError::InvalidIdentity(format!(
                    "malformed assumed-role resource in {arn}"
                )));
            }
            session
        }
        "role" => {
            if rest.is_empty() || rest.contains('/') {
                return Err(VendError::InvalidIdentity(format!(
                    "malformed role resource in {arn}"
                )));
            }
            rest
        }
        other => {
            return Err(VendError::InvalidIdentity(format!(
                "unsupported resource type {other:?} in {arn}"
            )));
        }
    };

    let sanitized_username = sanitize_username(raw_name)
        .ok_or_else(|| VendError::InvalidIdentity(format!("name sanitizes to empty in {arn}")))?;

    Ok(Caller {
        arn: arn.to_string(),
        account_id: account_id.to_string(),
        partition: partition.to_string(),
        sanitized_username,
        device_id,
    })
}

/// Reject resource strings carrying anything that could smuggle structure
/// into downstream comparisons: null bytes, control characters, traversal
/// sequences, non-ASCII.
fn validate_resource(resource: &str, arn: &str) -> Result<(), VendError> {
    if resource.is_empty() {
        return Err(VendError::InvalidIdentity(format!("empty resource in {arn}")));
    }
    if !resource.is_ascii() {
        return Err(VendError::InvalidIdentity(format!(
            "non-ASCII resource in {arn}"
        )));
    }
    if resource.bytes().any(|b| b == 0 || b.is_ascii_control()) {
        return Err(VendError::InvalidIdentity(format!(
            "control character in resource of {arn}"
        )));
    }
    if resource.contains("..") || resource.contains("//") {
        return Err(VendError::InvalidIdentity(format!(
            "path traversal in resource of {arn}"
        )));
    }
    Ok(())
}

/// Strip everything outside `[A-Za-z0-9_-]`, truncate to 64 chars. Case is
/// preserved. Returns `None` when nothing survives.
fn sanitize_username(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_USERNAME_LEN)
        .collect();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iam_user() {
        let caller = caller_from_arn("arn:aws:iam::123456789012:user/alice", None).unwrap();
        assert_eq!(caller.sanitized_username, "alice");
        assert_eq!(caller.account_id, "123456789012");
        assert_eq!(caller.partition, "aws");
    }

    #[test]
    fn test_iam_user_with_path() {
        let caller =
            caller_from_arn("arn:aws:iam::123456789012:user/engineering/platform/alice", None)
                .unwrap();
        assert_eq!(caller.sanitized_username, "alice");
    }

    #[test]
    fn test_assumed_role_uses_session_name() {
        let caller = caller_from_arn(
            "arn:aws:sts::123456789012:assumed-role/dev-role/alice.smith",
            None,
        )
        .unwrap();
        // The dot is stripped by sanitization.
        assert_eq!(caller.sanitized_username, "alicesmith");
    }

    #[test]
    fn test_role_arn() {
        let caller = caller_from_arn("arn:aws:iam::123456789012:role/ci-deployer", None).unwrap();
        assert_eq!(caller.sanitized_username, "ci-deployer");
    }

    #[test]
    fn test_gov_partition_accepted() {
        let caller =
            caller_from_arn("arn:aws-us-gov:iam::123456789012:user/alice", None).unwrap();
        assert_eq!(caller.partition, "aws-us-gov");
    }

    #[test]
    fn test_unknown_partition_rejected() {
        assert!(caller_from_arn("arn:aws-evil:iam::123456789012:user/alice", None).is_err());
    }

    #[test]
    fn test_not_an_arn() {
        assert!(caller_from_arn("alice", None).is_err());
        assert!(caller_from_arn("", None).is_err());
    }

    #[test]
    fn test_bad_account_id() {
        assert!(caller_from_arn("arn:aws:iam::12345:user/alice", None).is_err());
        assert!(caller_from_arn("arn:aws:iam::12345678901x:user/alice", None).is_err());
    }

    #[test]
    fn test_unsupported_resource_type() {
        assert!(caller_from_arn("arn:aws:iam::123456789012:group/admins", None).is_err());
        assert!(caller_from_arn("arn:aws:iam::123456789012:root", None).is_err());
    }

    #[test]
    fn test_traversal_rejected() {
        assert!(caller_from_arn("arn:aws:iam::123456789012:user/../alice", None).is_err());
        assert!(caller_from_arn("arn:aws:iam::123456789012:user//alice", None).is_err());
    }

    #[test]
    fn test_control_chars_rejected() {
        assert!(caller_from_arn("arn:aws:iam::123456789012:user/ali\x00ce", None).is_err());
        assert!(caller_from_arn("arn:aws:iam::123456789012:user/ali\tce", None).is_err());
    }

    #[test]
    fn test_non_ascii_rejected() {
        assert!(caller_from_arn("arn:aws:iam::123456789012:user/ålice", None).is_err());
    }

    #[test]
    fn test_sanitize_strips_punctuation() {
        let caller =
            caller_from_arn("arn:aws:sts::123456789012:assumed-role/r/alice@corp", None).unwrap();
        assert_eq!(caller.sanitized_username, "alicecorp");
    }

    #[test]
    fn test_session_name_all_punctuation_rejected() {
        assert!(caller_from_arn("arn:aws:sts::123456789012:assumed-role/r/@@@", None).is_err());
    }

    #[test]
    fn test_case_preserved() {
        let caller = caller_from_arn("arn:aws:iam::123456789012:user/Alice", None).unwrap();
        assert_eq!(caller.sanitized_username, "Alice");
    }

    #[test]
    fn test_truncated_to_64() {
        let long = "a".repeat(100);
        let caller =
            caller_from_arn(&format!("arn:aws:iam::123456789012:user/{long}"), None).unwrap();
        assert_eq!(caller.sanitized_username.len(), 64);
    }

    #[test]
    fn test_determinism() {
        let a = caller_from_arn("arn:aws:iam::123456789012:user/alice", None).unwrap();
        let b = caller_from_arn("arn:aws:iam::123456789012:user/alice", None).unwrap();
        assert_eq!(a, b);
    }
}
