//! Cross-module invariants over the deterministic pipeline pieces:
//! identity extraction → policy evaluation → source-identity stamping.

use sentinel_core::context::{DecisionContext, Mode};
use sentinel_core::identity::caller_from_arn;
use sentinel_core::policy::{Effect, evaluate, parse_policy};
use sentinel_core::source_identity::{DIRECT_MARKER, MAX_SOURCE_IDENTITY_LEN, SourceIdentity};

fn alice_ctx(profile: &str, mode: Mode) -> DecisionContext {
    let caller = caller_from_arn("arn:aws:iam::123456789012:user/alice", None).unwrap();
    DecisionContext::new(caller, profile, mode)
}

#[test]
fn allow_path_produces_a_stampable_identity() {
    // One allow rule for dev; alice requests dev.
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
    let ctx = alice_ctx("dev", Mode::Cli);
    let decision = evaluate(&policy, &ctx);
    assert_eq!(decision.effect, Effect::Allow);

    let identity =
        SourceIdentity::compose(&ctx.caller.sanitized_username, DIRECT_MARKER, &ctx.request_id)
            .unwrap();
    let rendered = identity.render();

    // sentinel:alice:direct:<hex request id>
    assert!(rendered.starts_with("sentinel:alice:direct:"));
    assert!(rendered.len() <= MAX_SOURCE_IDENTITY_LEN);
    assert_eq!(SourceIdentity::parse(&rendered).unwrap(), identity);
}

#[test]
fn default_deny_records_no_matching_rule() {
    let policy = parse_policy("version: \"1\"\nrules: []\n").unwrap();
    let decision = evaluate(&policy, &alice_ctx("dev", Mode::Cli));
    assert_eq!(decision.effect, Effect::Deny);
    assert_eq!(decision.matched_rule, None);
    assert_eq!(decision.reason, "no matching rule");
}

#[test]
fn worst_case_username_still_fits_the_protocol_limit() {
    // 64-char sanitized username (the extractor's cap) with the longest
    // marker form: the stamp must still fit, by truncating the user only.
    let long_user = "arn:aws:iam::123456789012:user/".to_string() + &"a".repeat(80);
    let caller = caller_from_arn(&long_user, None).unwrap();
    assert_eq!(caller.sanitized_username.len(), 64);

    let identity =
        SourceIdentity::compose(&caller.sanitized_username, "bgdeadbe", "cafef00d").unwrap();
    let rendered = identity.render();
    assert!(rendered.len() <= MAX_SOURCE_IDENTITY_LEN);
    assert!(rendered.ends_with(":bgdeadbe:cafef00d"));

    let parsed = SourceIdentity::parse(&rendered).unwrap();
    assert_eq!(parsed.marker, "bgdeadbe");
    assert_eq!(parsed.request_id, "cafef00d");
}

#[test]
fn cli_and_server_paths_resolve_identical_callers() {
    let arn = "arn:aws:sts::123456789012:assumed-role/platform/alice.smith";
    let from_cli = caller_from_arn(arn, None).unwrap();
    let from_server = caller_from_arn(arn, Some("ab".repeat(16))).unwrap();
    assert_eq!(from_cli.sanitized_username, from_server.sanitized_username);
    assert_eq!(from_cli.account_id, from_server.account_id);
}

#[test]
fn evaluation_is_pure_and_repeatable() {
    let policy = parse_policy(
        r#"
version: "1"
rules:
  - name: server-only
    effect: require_server
    conditions:
      profiles: [prod]
  - name: everyone-dev
    effect: allow
    conditions:
      profiles: [dev]
"#,
    )
    .unwrap();
    let ctx = alice_ctx("prod", Mode::CredentialProcess);
    let first = evaluate(&policy, &ctx);
    let second = evaluate(&policy, &ctx);
    assert_eq!(first, second);
    assert_eq!(first.effect, Effect::RequireServer);
}
