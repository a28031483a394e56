//! First-match policy evaluation.
//!
//! A pure, loop-and-return function over the ordered rule sequence. No
//! hidden state: callers build policies in tests and run the evaluator
//! directly. Evaluation is strictly sequential; the first rule whose
//! conditions all match decides the outcome.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;

use super::types::{AccessPolicy, DeviceCondition, Effect, RuleConditions, TimeCondition, Weekday};
use crate::context::DecisionContext;
use crate::posture::{DevicePosture, version_at_least};

/// Reason recorded when no rule matched.
pub const NO_MATCHING_RULE: &str = "no matching rule";

/// Outcome of evaluating a policy against a context.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub effect: Effect,
    /// Name of the matched rule; absent only for the default deny.
    pub matched_rule: Option<String>,
    pub reason: String,
    /// Session table pinned by the matched rule, if any.
    pub session_table: Option<String>,
}

impl Decision {
    fn default_deny() -> Self {
        Decision {
            effect: Effect::Deny,
            matched_rule: None,
            reason: NO_MATCHING_RULE.to_string(),
            session_table: None,
        }
    }
}

/// Evaluate a policy. First match wins; no match is a deny.
pub fn evaluate(policy: &AccessPolicy, ctx: &DecisionContext) -> Decision {
    for rule in &policy.rules {
        if !conditions_match(&rule.conditions, ctx) {
            continue;
        }
        return Decision {
            effect: rule.effect,
            matched_rule: Some(rule.name.clone()),
            reason: rule
                .reason
                .clone()
                .unwrap_or_else(|| format!("matched rule {}", rule.name)),
            session_table: rule.session_table.clone(),
        };
    }
    Decision::default_deny()
}

/// Whether every condition in the mapping holds for this context. Shared
/// with the approval store's auto-approve matching, which uses the same
/// semantics.
pub fn conditions_match(conds: &RuleConditions, ctx: &DecisionContext) -> bool {
    if !conds.profiles.is_empty() && !conds.profiles.iter().any(|p| *p == ctx.profile) {
        return false;
    }
    if !conds.users.is_empty()
        && !conds.users.iter().any(|u| *u == ctx.caller.sanitized_username)
    {
        return false;
    }
    if !conds.mode.is_empty() && !conds.mode.contains(&ctx.mode) {
        return false;
    }
    if let Some(ref time) = conds.time
        && !time_matches(time, ctx.request_time)
    {
        return false;
    }
    if let Some(ref device) = conds.device
        && !device_matches(device, ctx.device_posture.as_ref())
    {
        return false;
    }
    true
}

/// Wall-clock check in the rule's timezone (UTC when unspecified).
/// Timezones are validated at parse time; an unparseable zone here falls
/// back to UTC rather than panicking mid-request.
fn time_matches(cond: &TimeCondition, request_time: DateTime<Utc>) -> bool {
    let tz = cond
        .timezone
        .as_deref()
        .and_then(|name| Tz::from_str(name).ok())
        .unwrap_or(Tz::UTC);
    let local = request_time.with_timezone(&tz);

    if !cond.days.is_empty() {
        let today = Weekday::from_chrono(local.weekday());
        if !cond.days.contains(&today) {
            return false;
        }
    }

    if let Some(window) = cond.hours {
        let minute = (local.hour() * 60 + local.minute()) as u16;
        let start = window.start.minutes();
        let end = window.end.minutes();
        let inside = if start < end {
            // Plain half-open window.
            minute >= start && minute < end
        } else if start > end {
            // Wraps past midnight, e.g. 22:00–02:00.
            minute >= start || minute < end
        } else {
            // start == end: empty window.
            false
        };
        if !inside {
            return false;
        }
    }

    true
}

/// Device check. A rule that asserts any device sub-field can only match
/// when posture was resolved; unknown posture makes the rule skip.
fn device_matches(cond: &DeviceCondition, posture: Option<&DevicePosture>) -> bool {
    let asserts_any = cond.require_mdm == Some(true)
        || cond.require_mdm_compliant == Some(true)
        || cond.require_encryption == Some(true)
        || cond.require_firewall == Some(true)
        || cond.min_os_version.is_some()
        || !cond.allowed_os_types.is_empty();
    if !asserts_any {
        return true;
    }
    let Some(posture) = posture else {
        return false;
    };

    if cond.require_mdm == Some(true) && !posture.mdm_enrolled {
        return false;
    }
    if cond.require_mdm_compliant == Some(true) && !posture.mdm_compliant {
        return false;
    }
    if cond.require_encryption == Some(true) && !posture.disk_encrypted {
        return false;
    }
    if cond.require_firewall == Some(true) && !posture.firewall_enabled {
        return false;
    }
    if !cond.allowed_os_types.is_empty()
        && !cond
            .allowed_os_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&posture.os_type))
    {
        return false;
    }
    if let Some(ref min) = cond.min_os_version {
        // Unparseable reported versions fail the check, not the request.
        if !version_at_least(&posture.os_version, min).unwrap_or(false) {
            return false;
        }
    }
    true
}
