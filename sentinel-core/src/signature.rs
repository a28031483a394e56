//! Policy signature envelope.
//!
//! The envelope travels beside the policy in the parameter store as JSON.
//! The asymmetric verification happens remotely (KMS); this module owns
//! the envelope shape, the content hash, and the local checks that do not
//! need a network: hash agreement and algorithm pinning.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::VendError;

/// The only signing algorithm Sentinel accepts.
pub const SIGNING_ALGORITHM: &str = "RSASSA_PSS_SHA_256";

/// `{root}/signatures/{profile}` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    /// Base64 signature bytes.
    pub signature: String,
    pub metadata: SignatureMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureMetadata {
    pub key_id: String,
    pub algorithm: String,
    /// RFC 3339 UTC.
    pub signed_at: String,
    /// SHA-256 hex over the policy bytes.
    pub policy_hash: String,
}

impl SignatureEnvelope {
    pub fn from_json(json: &str) -> Result<SignatureEnvelope, VendError> {
        serde_json::from_str(json)
            .map_err(|e| VendError::PolicySignatureInvalid(format!("envelope parse: {e}")))
    }

    /// Decode the signature bytes.
    pub fn signature_bytes(&self) -> Result<Vec<u8>, VendError> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&self.signature)
            .map_err(|e| VendError::PolicySignatureInvalid(format!("signature base64: {e}")))
    }

    /// Local pre-checks before the remote verify call: the algorithm must
    /// be the pinned one and the embedded hash must match the policy
    /// bytes. Any byte change in the policy text fails here.
    pub fn check_content(&self, policy_text: &str) -> Result<(), VendError> {
        if self.metadata.algorithm != SIGNING_ALGORITHM {
            return Err(VendError::PolicySignatureInvalid(format!(
                "unexpected algorithm {}",
                self.metadata.algorithm
            )));
        }
        let actual = content_hash(policy_text);
        if actual != self.metadata.policy_hash {
            return Err(VendError::PolicySignatureInvalid(
                "policy hash mismatch".into(),
            ));
        }
        Ok(())
    }
}

/// SHA-256 hex over the raw policy bytes.
pub fn content_hash(policy_text: &str) -> String {
    hex::encode(Sha256::digest(policy_text.as_bytes()))
}

/// The message digest KMS verifies against (raw bytes, not hex).
pub fn content_digest(policy_text: &str) -> Vec<u8> {
    Sha256::digest(policy_text.as_bytes()).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_for(text: &str) -> SignatureEnvelope {
        SignatureEnvelope {
            signature: "c2lnbmF0dXJl".into(),
            metadata: SignatureMetadata {
                key_id: "alias/sentinel-policy".into(),
                algorithm: SIGNING_ALGORITHM.into(),
                signed_at: "2024-03-04T00:00:00Z".into(),
                policy_hash: content_hash(text),
            },
        }
    }

    #[test]
    fn test_envelope_json_round_trip() {
        let env = envelope_for("version: \"1\"\n");
        let json = serde_json::to_string(&env).unwrap();
        let back = SignatureEnvelope::from_json(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_envelope_wire_field_names() {
        let json = r#"{
          "signature": "c2ln",
          "metadata": {
            "key_id": "k",
            "algorithm": "RSASSA_PSS_SHA_256",
            "signed_at": "2024-01-01T00:00:00Z",
            "policy_hash": "00"
          }
        }"#;
        let env = SignatureEnvelope::from_json(json).unwrap();
        assert_eq!(env.metadata.key_id, "k");
    }

    #[test]
    fn test_content_check_passes() {
        let text = "version: \"1\"\nrules: []\n";
        envelope_for(text).check_content(text).unwrap();
    }

    #[test]
    fn test_any_byte_change_fails_hash() {
        let text = "version: \"1\"\nrules: []\n";
        let env = envelope_for(text);
        let tampered = "version: \"1\"\nrules: [] \n";
        assert!(matches!(
            env.check_content(tampered),
            Err(VendError::PolicySignatureInvalid(_))
        ));
    }

    #[test]
    fn test_wrong_algorithm_rejected() {
        let text = "x";
        let mut env = envelope_for(text);
        env.metadata.algorithm = "RSASSA_PKCS1_V1_5_SHA_256".into();
        assert!(env.check_content(text).is_err());
    }

    #[test]
    fn test_bad_base64_signature() {
        let mut env = envelope_for("x");
        env.signature = "not-base64!!!".into();
        assert!(env.signature_bytes().is_err());
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        // Known vector: sha256("") =
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(content_digest("").len(), 32);
    }
}
