//! Access-policy model, parsing, and first-match evaluation.
//!
//! - `types` — the serde model of policy documents and conditions
//! - `parse` — YAML parsing plus the validation serde cannot express
//! - `eval` — the pure first-match evaluator

pub mod eval;
pub mod parse;
pub mod types;

pub use eval::{Decision, NO_MATCHING_RULE, conditions_match, evaluate};
pub use parse::{PolicyParseError, parse_policy, validate_policy};
pub use types::{AccessPolicy, AccessRule, DeviceCondition, Effect, RuleConditions, TimeCondition};
