//! Sentinel core — the deterministic half of the credential broker.
//!
//! Everything here is pure or process-local: identity extraction, the
//! policy model and its first-match evaluator, source-identity stamping,
//! the device-posture model, in-memory rate limiting, audit-record
//! signing, and the shared error taxonomy. The AWS-facing stores and the
//! vend pipeline live in `sentinel-broker`; the local credentials server
//! lives in `sentinel-server`.

pub mod audit;
pub mod context;
pub mod error;
pub mod identity;
pub mod policy;
pub mod posture;
pub mod ratelimit;
pub mod signature;
pub mod source_identity;

pub use context::{DecisionContext, Mode};
pub use error::VendError;
pub use identity::{Caller, caller_from_arn};
pub use policy::{AccessPolicy, Decision, Effect, evaluate, parse_policy};
pub use posture::DevicePosture;
pub use ratelimit::{MemoryRateLimiter, RateLimitConfig, RateLimitDecision};
pub use source_identity::SourceIdentity;
