//! Typed model of the access policy document.
//!
//! Policies are YAML, strict on input: unknown keys, unknown effects, and
//! unknown weekdays are parse errors, not warnings. An empty `rules`
//! sequence is a valid policy that denies everything.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::context::Mode;

/// The only policy document version we understand.
pub const POLICY_VERSION: &str = "1";

/// A versioned, ordered sequence of access rules. Replaced wholesale on
/// every policy write; never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessPolicy {
    /// Must be the literal string "1".
    pub version: String,
    #[serde(default)]
    pub rules: Vec<AccessRule>,
}

impl AccessPolicy {
    /// Whether any rule in this policy asserts a device condition. Drives
    /// whether the posture client is consulted at all.
    pub fn mentions_device(&self) -> bool {
        self.rules.iter().any(|r| r.conditions.device.is_some())
    }
}

/// One rule. Evaluation is first-match over the ordered sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessRule {
    /// Unique within the policy.
    pub name: String,
    pub effect: Effect,
    #[serde(default)]
    pub conditions: RuleConditions,
    /// Shown to the caller on deny; policy-authored, so it is the one
    /// message that crosses the sanitization boundary.
    #[serde(default)]
    pub reason: Option<String>,
    /// Session table pinned by the policy author. Wins over any
    /// caller-provided override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_table: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
    RequireApproval,
    RequireServer,
    RequireServerSession,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
            Effect::RequireApproval => "require_approval",
            Effect::RequireServer => "require_server",
            Effect::RequireServerSession => "require_server_session",
        }
    }
}

/// AND-combined condition mapping. Empty sets match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConditions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mode: Vec<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceCondition>,
}

impl RuleConditions {
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
            && self.users.is_empty()
            && self.mode.is_empty()
            && self.time.is_none()
            && self.device.is_none()
    }
}

/// Wall-clock window. Absent sub-fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeCondition {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<Weekday>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<HourWindow>,
    /// IANA timezone name. Defaults to UTC when absent. Validated at
    /// parse time so evaluation never sees a bad zone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub fn from_chrono(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }
}

/// Half-open `[start, end)` window. `start > end` wraps past midnight;
/// `start == end` is an empty window that matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HourWindow {
    pub start: HourMinute,
    pub end: HourMinute,
}

/// A `HH:MM` wall-clock time stored as minutes from midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HourMinute(pub u16);

impl HourMinute {
    /// Strict `HH:MM`, 24-hour. Exactly five chars, zero-padded.
    pub fn parse(s: &str) -> Option<HourMinute> {
        let bytes = s.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return None;
        }
        let hour = s[0..2].parse::<u16>().ok()?;
        let minute = s[3..5].parse::<u16>().ok()?;
        if hour > 23 || minute > 59 || !bytes[0].is_ascii_digit() || !bytes[3].is_ascii_digit() {
            return None;
        }
        Some(HourMinute(hour * 60 + minute))
    }

    pub fn minutes(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for HourMinute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl Serialize for HourMinute {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HourMinute {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        HourMinute::parse(&s)
            .ok_or_else(|| D::Error::custom(format!("invalid time {s:?}, expected HH:MM")))
    }
}

/// Device posture assertions. Each sub-field is either absent (not
/// checked) or checked against the resolved posture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_mdm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_mdm_compliant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_encryption: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_firewall: Option<bool>,
    /// Dotted numeric version, compared component-wise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_os_types: Vec<String>,
}
