//! Signed-policy loading.
//!
//! Three stacked layers, same order every time: raw fetch from the
//! parameter store, signature verification against KMS, then a TTL cache.
//! Tampering fails closed even in advisory mode — a present-but-invalid
//! signature is always fatal; only a *missing* signature is forgiven when
//! enforcement is off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::{MessageType, SigningAlgorithmSpec};
use parking_lot::RwLock;

use sentinel_core::error::VendError;
use sentinel_core::policy::{AccessPolicy, parse_policy};
use sentinel_core::signature::{SignatureEnvelope, content_digest};

use crate::retry::{is_transient_sdk, with_backoff};

struct CacheEntry {
    policy: Arc<AccessPolicy>,
    deadline: Instant,
}

struct RoleEntry {
    arn: String,
    deadline: Instant,
}

pub struct PolicyLoader {
    ssm: aws_sdk_ssm::Client,
    kms: aws_sdk_kms::Client,
    root: String,
    signing_key_id: String,
    enforce_signatures: bool,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
    roles: RwLock<HashMap<String, RoleEntry>>,
}

impl PolicyLoader {
    pub fn new(
        ssm: aws_sdk_ssm::Client,
        kms: aws_sdk_kms::Client,
        root: impl Into<String>,
        signing_key_id: impl Into<String>,
        enforce_signatures: bool,
        ttl: Duration,
    ) -> Self {
        PolicyLoader {
            ssm,
            kms,
            root: root.into(),
            signing_key_id: signing_key_id.into(),
            enforce_signatures,
            ttl,
            cache: RwLock::new(HashMap::new()),
            roles: RwLock::new(HashMap::new()),
        }
    }

    /// Load, verify, and parse the policy for a profile. Cached for the
    /// configured TTL; concurrent readers share the cached `Arc`.
    pub async fn load(&self, profile: &str) -> Result<Arc<AccessPolicy>, VendError> {
        if let Some(policy) = self.cached(profile) {
            return Ok(policy);
        }

        let text = self.fetch_policy_text(profile).await?;
        let envelope = self.fetch_signature(profile).await?;
        self.verify(&text, envelope.as_ref()).await?;

        let policy = Arc::new(
            parse_policy(&text).map_err(|e| VendError::PolicyLoadFailed(format!(
                "policy for {profile}: {e}"
            )))?,
        );

        self.cache.write().insert(
            profile.to_string(),
            CacheEntry {
                policy: Arc::clone(&policy),
                deadline: Instant::now() + self.ttl,
            },
        );
        Ok(policy)
    }

    /// Resolve a profile to its target role ARN via `{root}/roles/{profile}`.
    pub async fn role_arn(&self, profile: &str) -> Result<String, VendError> {
        {
            let roles = self.roles.read();
            if let Some(entry) = roles.get(profile)
                && entry.deadline > Instant::now()
            {
                return Ok(entry.arn.clone());
            }
        }
        let name = format!("{}/roles/{}", self.root, profile);
        let arn = self.fetch_parameter(&name).await?.ok_or_else(|| {
            VendError::PolicyLoadFailed(format!("no role mapping at {name}"))
        })?;
        self.roles.write().insert(
            profile.to_string(),
            RoleEntry {
                arn: arn.clone(),
                deadline: Instant::now() + self.ttl,
            },
        );
        Ok(arn)
    }

    /// List profiles by walking `{root}/policies` recursively.
    pub async fn list_profiles(&self) -> Result<Vec<String>, VendError> {
        let prefix = format!("{}/policies/", self.root);
        let mut profiles = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let ssm = self.ssm.clone();
            let path = format!("{}/policies", self.root);
            let token = next_token.clone();
            let out = with_backoff("ssm_get_parameters_by_path", is_transient_sdk, || {
                let mut req = ssm
                    .get_parameters_by_path()
                    .path(&path)
                    .recursive(true)
                    .with_decryption(true);
                if let Some(ref t) = token {
                    req = req.next_token(t);
                }
                req.send()
            })
            .await
            .map_err(|e| VendError::PolicyLoadFailed(format!("list {path}: {e}")))?;

            for param in out.parameters() {
                if let Some(name) = param.name()
                    && let Some(profile) = name.strip_prefix(&prefix)
                {
                    profiles.push(profile.to_string());
                }
            }
            next_token = out.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        profiles.sort();
        Ok(profiles)
    }

    /// Drop a profile's cached policy (and role mapping) immediately.
    pub fn invalidate(&self, profile: &str) {
        self.cache.write().remove(profile);
        self.roles.write().remove(profile);
    }

    fn cached(&self, profile: &str) -> Option<Arc<AccessPolicy>> {
        let now = Instant::now();
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(profile) {
                if entry.deadline > now {
                    return Some(Arc::clone(&entry.policy));
                }
            } else {
                return None;
            }
        }
        // Expired: purge under the write lock so the next read re-fetches.
        let mut cache = self.cache.write();
        let lapsed = cache.get(profile).is_some_and(|entry| entry.deadline <= now);
        if lapsed {
            cache.remove(profile);
        }
        None
    }

    async fn fetch_policy_text(&self, profile: &str) -> Result<String, VendError> {
        let name = format!("{}/policies/{}", self.root, profile);
        self.fetch_parameter(&name)
            .await?
            .ok_or_else(|| VendError::PolicyLoadFailed(format!("no policy at {name}")))
    }

    /// Fetch the signature envelope; `None` means the parameter does not
    /// exist, which is only acceptable when enforcement is off.
    async fn fetch_signature(&self, profile: &str) -> Result<Option<SignatureEnvelope>, VendError> {
        let name = format!("{}/signatures/{}", self.root, profile);
        match self.fetch_parameter(&name).await? {
            Some(json) => Ok(Some(SignatureEnvelope::from_json(&json)?)),
            None => Ok(None),
        }
    }

    /// Apply the enforcement contract and run the remote verification.
    async fn verify(
        &self,
        policy_text: &str,
        envelope: Option<&SignatureEnvelope>,
    ) -> Result<(), VendError> {
        let Some(envelope) = envelope else {
            if self.enforce_signatures {
                return Err(VendError::PolicyUnsigned(
                    "signature parameter missing and enforcement is on".into(),
                ));
            }
            tracing::warn!("policy is unsigned; admitted because enforcement is off");
            return Ok(());
        };

        // Local checks first: algorithm pin and content hash. Any byte
        // change in the policy text dies here without a network call.
        envelope.check_content(policy_text)?;
        let signature = envelope.signature_bytes()?;
        let digest = content_digest(policy_text);

        let kms = self.kms.clone();
        let key_id = self.signing_key_id.clone();
        let result = with_backoff("kms_verify", is_transient_sdk, || {
            kms.verify()
                .key_id(&key_id)
                .message(Blob::new(digest.clone()))
                .message_type(MessageType::Digest)
                .signing_algorithm(SigningAlgorithmSpec::RsassaPssSha256)
                .signature(Blob::new(signature.clone()))
                .send()
        })
        .await;

        match result {
            Ok(out) if out.signature_valid() => Ok(()),
            Ok(_) => Err(VendError::PolicySignatureInvalid(
                "kms reported invalid signature".into(),
            )),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_kms_invalid_signature_exception() {
                    Err(VendError::PolicySignatureInvalid(service.to_string()))
                } else {
                    Err(VendError::PolicyVerificationUnavailable(service.to_string()))
                }
            }
        }
    }

    /// One parameter read with retries. `Ok(None)` only for not-found.
    async fn fetch_parameter(&self, name: &str) -> Result<Option<String>, VendError> {
        let ssm = self.ssm.clone();
        let result = with_backoff("ssm_get_parameter", is_transient_sdk, || {
            ssm.get_parameter().name(name).with_decryption(true).send()
        })
        .await;

        match result {
            Ok(out) => Ok(out.parameter().and_then(|p| p.value()).map(str::to_string)),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_parameter_not_found() {
                    Ok(None)
                } else {
                    Err(VendError::PolicyLoadFailed(format!("{name}: {service}")))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::signature::{SignatureMetadata, content_hash};

    fn envelope_for(text: &str) -> SignatureEnvelope {
        SignatureEnvelope {
            signature: "c2ln".into(),
            metadata: SignatureMetadata {
                key_id: "alias/sentinel-policy".into(),
                algorithm: "RSASSA_PSS_SHA_256".into(),
                signed_at: "2024-01-01T00:00:00Z".into(),
                policy_hash: content_hash(text),
            },
        }
    }

    /// A loader whose clients point nowhere. Fine for the paths that
    /// decide before any network call.
    fn offline_loader(enforce: bool) -> PolicyLoader {
        let ssm = aws_sdk_ssm::Client::from_conf(
            aws_sdk_ssm::Config::builder()
                .behavior_version(aws_sdk_ssm::config::BehaviorVersion::latest())
                .region(aws_sdk_ssm::config::Region::new("us-east-1"))
                .build(),
        );
        let kms = aws_sdk_kms::Client::from_conf(
            aws_sdk_kms::Config::builder()
                .behavior_version(aws_sdk_kms::config::BehaviorVersion::latest())
                .region(aws_sdk_kms::config::Region::new("us-east-1"))
                .build(),
        );
        PolicyLoader::new(
            ssm,
            kms,
            "/sentinel",
            "alias/sentinel-policy",
            enforce,
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_missing_signature_with_enforcement_fails() {
        let loader = offline_loader(true);
        let err = loader.verify("version: \"1\"\n", None).await.unwrap_err();
        assert!(matches!(err, VendError::PolicyUnsigned(_)));
    }

    #[tokio::test]
    async fn test_missing_signature_without_enforcement_is_admitted() {
        let loader = offline_loader(false);
        loader.verify("version: \"1\"\n", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_signature_fails_even_without_enforcement() {
        // Tampering fails closed in advisory mode: a present envelope
        // whose hash disagrees with the text never verifies.
        let loader = offline_loader(false);
        let envelope = envelope_for("version: \"1\"\n");
        let err = loader
            .verify("version: \"2\"\n", Some(&envelope))
            .await
            .unwrap_err();
        assert!(matches!(err, VendError::PolicySignatureInvalid(_)));
    }

    #[test]
    fn test_tampered_text_fails_before_any_network_call() {
        let envelope = envelope_for("version: \"1\"\n");
        let err = envelope.check_content("version: \"1\" \n").unwrap_err();
        assert!(matches!(err, VendError::PolicySignatureInvalid(_)));
    }

    #[test]
    fn test_envelope_parse_failure_is_signature_invalid() {
        let err = SignatureEnvelope::from_json("{not json").unwrap_err();
        assert!(matches!(err, VendError::PolicySignatureInvalid(_)));
    }
}
