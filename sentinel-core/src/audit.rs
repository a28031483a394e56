//! Decision-log records.
//!
//! Every vend attempt produces one JSON Lines record, HMAC-SHA-256 signed
//! so downstream tooling can detect tampering. The MAC is computed over
//! the canonical serialization of the record with the `hmac` field empty,
//! then stored in that field — the same sign-with-empty-field scheme used
//! for every signed object in this codebase.

use std::io::Write;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::VendError;

type HmacSha256 = Hmac<Sha256>;

/// One line of the decision log. Field order is the canonical
/// serialization order; do not reorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// RFC 3339 UTC.
    pub timestamp: String,
    pub user: String,
    pub profile: String,
    /// The decided effect (`allow`, `deny`, ...).
    pub effect: String,
    /// Matched rule name, or "-" for the default deny.
    pub rule: String,
    pub approval_marker: String,
    pub request_id: String,
    pub source_identity: String,
    pub duration_seconds: i64,
    /// Whether a device id was present on the request.
    pub device_bound: bool,
    /// HMAC-SHA-256 hex over the canonical serialization of the other
    /// fields. Empty until signed.
    #[serde(default)]
    pub hmac: String,
}

impl DecisionRecord {
    /// Compute and attach the MAC.
    pub fn sign(&mut self, key: &[u8]) -> Result<(), VendError> {
        self.hmac = self.compute_mac(key)?;
        Ok(())
    }

    /// Recompute the MAC and compare. Returns false for unsigned records.
    pub fn verify(&self, key: &[u8]) -> Result<bool, VendError> {
        if self.hmac.is_empty() {
            return Ok(false);
        }
        Ok(self.compute_mac(key)? == self.hmac)
    }

    fn compute_mac(&self, key: &[u8]) -> Result<String, VendError> {
        let mut unsigned = self.clone();
        unsigned.hmac = String::new();
        let canonical = serde_json::to_vec(&unsigned)
            .map_err(|e| VendError::CredentialIssueFailed(format!("audit serialize: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| VendError::CredentialIssueFailed(format!("audit mac key: {e}")))?;
        mac.update(&canonical);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Append-only JSON Lines sink with a tracing mirror.
pub struct AuditLog<W: Write + Send> {
    key: Vec<u8>,
    sink: Mutex<W>,
}

impl<W: Write + Send> AuditLog<W> {
    pub fn new(key: impl Into<Vec<u8>>, sink: W) -> Self {
        AuditLog {
            key: key.into(),
            sink: Mutex::new(sink),
        }
    }

    /// Sign and append one record. The write is line-buffered under a
    /// short lock; records from concurrent requests interleave whole.
    pub fn append(&self, mut record: DecisionRecord) -> Result<(), VendError> {
        record.sign(&self.key)?;
        let line = serde_json::to_string(&record)
            .map_err(|e| VendError::CredentialIssueFailed(format!("audit serialize: {e}")))?;

        tracing::info!(
            user = %record.user,
            profile = %record.profile,
            effect = %record.effect,
            rule = %record.rule,
            request_id = %record.request_id,
            "decision"
        );

        let mut sink = self.sink.lock();
        writeln!(sink, "{line}")
            .and_then(|_| sink.flush())
            .map_err(|e| VendError::CredentialIssueFailed(format!("audit write: {e}")))
    }
}
