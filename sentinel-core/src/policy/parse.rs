//! Policy document parsing and structural validation.
//!
//! Serde handles shape (unknown keys, unknown effects, malformed times are
//! deserialization errors); this module layers the checks serde cannot
//! express: the version literal, rule-name uniqueness, and timezone names.

use std::collections::HashSet;
use std::str::FromStr;

use thiserror::Error;

use super::types::{AccessPolicy, POLICY_VERSION};

#[derive(Debug, Error)]
pub enum PolicyParseError {
    #[error("policy YAML invalid: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported policy version {0:?}, expected \"1\"")]
    Version(String),
    #[error("duplicate rule name {0:?}")]
    DuplicateRuleName(String),
    #[error("rule {rule:?} has invalid timezone {timezone:?}")]
    InvalidTimezone { rule: String, timezone: String },
    #[error("rule {rule:?} has invalid min_os_version {version:?}")]
    InvalidOsVersion { rule: String, version: String },
}

/// Parse and validate a policy document from YAML text.
pub fn parse_policy(yaml: &str) -> Result<AccessPolicy, PolicyParseError> {
    let policy: AccessPolicy = serde_yaml::from_str(yaml)?;
    validate_policy(&policy)?;
    Ok(policy)
}

/// Structural checks over an already-deserialized policy.
pub fn validate_policy(policy: &AccessPolicy) -> Result<(), PolicyParseError> {
    if policy.version != POLICY_VERSION {
        return Err(PolicyParseError::Version(policy.version.clone()));
    }

    let mut seen = HashSet::new();
    for rule in &policy.rules {
        if !seen.insert(rule.name.as_str()) {
            return Err(PolicyParseError::DuplicateRuleName(rule.name.clone()));
        }
        if let Some(ref time) = rule.conditions.time
            && let Some(ref tz) = time.timezone
            && chrono_tz::Tz::from_str(tz).is_err()
        {
            return Err(PolicyParseError::InvalidTimezone {
                rule: rule.name.clone(),
                timezone: tz.clone(),
            });
        }
        if let Some(ref device) = rule.conditions.device
            && let Some(ref min) = device.min_os_version
            && crate::posture::parse_version(min).is_none()
        {
            return Err(PolicyParseError::InvalidOsVersion {
                rule: rule.name.clone(),
                version: min.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::Effect;

    #[test]
    fn test_minimal_allow_policy() {
        let policy = parse_policy(
            r#"
version: "1"
rules:
  - name: dev-open
    effect: allow
    conditions:
      profiles: [dev]
"#,
        )
        .unwrap();
        assert_eq!(policy.rules.len(), 1);
        assert_eq!(policy.rules[0].effect, Effect::Allow);
        assert_eq!(policy.rules[0].conditions.profiles, vec!["dev"]);
    }

    #[test]
    fn test_empty_rules_is_valid() {
        let policy = parse_policy("version: \"1\"\nrules: []\n").unwrap();
        assert!(policy.rules.is_empty());
    }

    #[test]
    fn test_missing_rules_key_defaults_empty() {
        let policy = parse_policy("version: \"1\"\n").unwrap();
        assert!(policy.rules.is_empty());
    }

    #[test]
    fn test_wrong_version_rejected() {
        assert!(matches!(
            parse_policy("version: \"2\"\nrules: []\n"),
            Err(PolicyParseError::Version(_))
        ));
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let err = parse_policy("version: \"1\"\nrules: []\nextra: true\n");
        assert!(matches!(err, Err(PolicyParseError::Yaml(_))));
    }

    #[test]
    fn test_unknown_effect_rejected() {
        let err = parse_policy(
            r#"
version: "1"
rules:
  - name: r
    effect: permit
"#,
        );
        assert!(matches!(err, Err(PolicyParseError::Yaml(_))));
    }

    #[test]
    fn test_unknown_weekday_rejected() {
        let err = parse_policy(
            r#"
version: "1"
rules:
  - name: r
    effect: allow
    conditions:
      time:
        days: [funday]
"#,
        );
        assert!(matches!(err, Err(PolicyParseError::Yaml(_))));
    }

    #[test]
    fn test_malformed_time_rejected() {
        let err = parse_policy(
            r#"
version: "1"
rules:
  - name: r
    effect: allow
    conditions:
      time:
        hours: { start: "9:00", end: "18:00" }
"#,
        );
        assert!(matches!(err, Err(PolicyParseError::Yaml(_))));
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let err = parse_policy(
            r#"
version: "1"
rules:
  - name: r
    effect: allow
    conditions:
      time:
        timezone: "Mars/Olympus_Mons"
"#,
        );
        assert!(matches!(err, Err(PolicyParseError::InvalidTimezone { .. })));
    }

    #[test]
    fn test_valid_timezone_accepted() {
        parse_policy(
            r#"
version: "1"
rules:
  - name: business-hours
    effect: allow
    conditions:
      profiles: [staging]
      time:
        days: [monday, tuesday, wednesday, thursday, friday]
        hours: { start: "09:00", end: "18:00" }
        timezone: "America/New_York"
"#,
        )
        .unwrap();
    }

    #[test]
    fn test_duplicate_rule_names_rejected() {
        let err = parse_policy(
            r#"
version: "1"
rules:
  - name: r
    effect: allow
  - name: r
    effect: deny
"#,
        );
        assert!(matches!(err, Err(PolicyParseError::DuplicateRuleName(_))));
    }

    #[test]
    fn test_bad_min_os_version_rejected() {
        let err = parse_policy(
            r#"
version: "1"
rules:
  - name: r
    effect: allow
    conditions:
      device:
        min_os_version: "latest"
"#,
        );
        assert!(matches!(err, Err(PolicyParseError::InvalidOsVersion { .. })));
    }

    #[test]
    fn test_session_table_parsed() {
        let policy = parse_policy(
            r#"
version: "1"
rules:
  - name: prod-server-only
    effect: require_server_session
    session_table: sentinel-sessions-prod
    conditions:
      profiles: [prod]
"#,
        )
        .unwrap();
        assert_eq!(
            policy.rules[0].session_table.as_deref(),
            Some("sentinel-sessions-prod")
        );
    }
}
