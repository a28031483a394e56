//! Device posture resolution.
//!
//! Posture comes from an MDM provider over HTTPS with a bearer token held
//! in the secret store. Successful resolutions are cached briefly;
//! provider failures follow the configured disposition — fail-closed
//! turns into `DevicePostureFailed`, fail-open substitutes an unknown
//! posture and lets the policy rules decide.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use sentinel_core::error::VendError;
use sentinel_core::posture::DevicePosture;

use crate::config::FailMode;
use crate::retry::{is_transient_sdk, with_backoff};

#[derive(Debug, Error)]
pub enum MdmError {
    #[error("mdm request failed: {0}")]
    Http(String),
    #[error("mdm response invalid: {0}")]
    Decode(String),
    #[error("mdm auth failed: {0}")]
    Auth(String),
    #[error("mdm token unavailable: {0}")]
    Secret(String),
    #[error("device not found")]
    NotFound,
}

/// Anything that can answer a posture lookup. The HTTP implementation is
/// the production one; tests plug in stubs.
pub trait MdmProvider: Send + Sync {
    fn lookup(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<DevicePosture, MdmError>> + Send;
}

/// MDM over HTTPS with bearer auth. The token lives in Secrets Manager
/// and is cached in-process for about an hour.
pub struct HttpMdmProvider {
    http: reqwest::Client,
    base_url: String,
    secrets: aws_sdk_secretsmanager::Client,
    secret_id: String,
    token_ttl: Duration,
    token: Mutex<Option<(String, Instant)>>,
}

impl HttpMdmProvider {
    pub fn new(
        base_url: impl Into<String>,
        secrets: aws_sdk_secretsmanager::Client,
        secret_id: impl Into<String>,
        token_ttl: Duration,
    ) -> Self {
        HttpMdmProvider {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            secrets,
            secret_id: secret_id.into(),
            token_ttl,
            token: Mutex::new(None),
        }
    }

    async fn bearer(&self) -> Result<String, MdmError> {
        if let Some((token, fetched)) = self.token.lock().clone()
            && fetched.elapsed() < self.token_ttl
        {
            return Ok(token);
        }

        let secrets = self.secrets.clone();
        let secret_id = self.secret_id.clone();
        let out = with_backoff("secrets_get_mdm_token", is_transient_sdk, || {
            secrets.get_secret_value().secret_id(&secret_id).send()
        })
        .await
        .map_err(|e| MdmError::Secret(e.into_service_error().to_string()))?;

        let token = out
            .secret_string()
            .map(str::to_string)
            .ok_or_else(|| MdmError::Secret("secret has no string value".into()))?;
        *self.token.lock() = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

impl MdmProvider for HttpMdmProvider {
    fn lookup(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<DevicePosture, MdmError>> + Send {
        let url = format!(
            "{}/v1/devices/{}/posture",
            self.base_url.trim_end_matches('/'),
            device_id
        );
        async move {
            let token = self.bearer().await?;
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| MdmError::Http(e.to_string()))?;

            match resp.status().as_u16() {
                200 => resp
                    .json::<DevicePosture>()
                    .await
                    .map_err(|e| MdmError::Decode(e.to_string())),
                404 => Err(MdmError::NotFound),
                401 | 403 => {
                    // Token may have rotated underneath us; drop the cache
                    // so the next lookup re-fetches.
                    *self.token.lock() = None;
                    Err(MdmError::Auth(format!("status {}", resp.status())))
                }
                status => Err(MdmError::Http(format!("status {status}"))),
            }
        }
    }
}

/// Caching front for a posture provider with the configured disposition.
pub struct PostureClient<P: MdmProvider> {
    provider: P,
    fail_mode: FailMode,
    ttl: Duration,
    cache: Mutex<HashMap<String, (DevicePosture, Instant)>>,
}

impl<P: MdmProvider> PostureClient<P> {
    pub fn new(provider: P, fail_mode: FailMode, ttl: Duration) -> Self {
        PostureClient {
            provider,
            fail_mode,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve posture for a device id. Unknown devices count as provider
    /// answers (not-enrolled posture), not failures.
    pub async fn resolve(&self, device_id: &str) -> Result<DevicePosture, VendError> {
        if let Some((posture, fetched)) = self.cache.lock().get(device_id).cloned()
            && fetched.elapsed() < self.ttl
        {
            return Ok(posture);
        }

        match self.provider.lookup(device_id).await {
            Ok(posture) => {
                self.cache
                    .lock()
                    .insert(device_id.to_string(), (posture.clone(), Instant::now()));
                Ok(posture)
            }
            Err(MdmError::NotFound) => {
                // A device the MDM has never seen is a definitive answer:
                // unenrolled. Cached like any other resolution.
                let posture = DevicePosture::unknown();
                self.cache
                    .lock()
                    .insert(device_id.to_string(), (posture.clone(), Instant::now()));
                Ok(posture)
            }
            Err(err) => match self.fail_mode {
                FailMode::Closed => Err(VendError::DevicePostureFailed(err.to_string())),
                FailMode::Open => {
                    tracing::warn!(%err, device_id, "mdm lookup failed, failing open");
                    Ok(DevicePosture::unknown())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubProvider {
        calls: AtomicU32,
        response: Result<DevicePosture, ()>,
    }

    impl StubProvider {
        fn ok(posture: DevicePosture) -> Self {
            StubProvider {
                calls: AtomicU32::new(0),
                response: Ok(posture),
            }
        }

        fn failing() -> Self {
            StubProvider {
                calls: AtomicU32::new(0),
                response: Err(()),
            }
        }
    }

    impl MdmProvider for StubProvider {
        fn lookup(
            &self,
            _device_id: &str,
        ) -> impl Future<Output = Result<DevicePosture, MdmError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let response = self
                .response
                .clone()
                .map_err(|_| MdmError::Http("connection refused".into()));
            async move { response }
        }
    }

    fn enrolled() -> DevicePosture {
        DevicePosture {
            mdm_enrolled: true,
            mdm_compliant: true,
            disk_encrypted: true,
            firewall_enabled: true,
            os_type: "macos".into(),
            os_version: "14.2".into(),
        }
    }

    #[tokio::test]
    async fn test_resolution_is_cached() {
        let client = PostureClient::new(
            StubProvider::ok(enrolled()),
            FailMode::Closed,
            Duration::from_secs(300),
        );
        let a = client.resolve("aa".repeat(16).as_str()).await.unwrap();
        let b = client.resolve("aa".repeat(16).as_str()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(client.provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_closed_surfaces_error() {
        let client = PostureClient::new(
            StubProvider::failing(),
            FailMode::Closed,
            Duration::from_secs(300),
        );
        let err = client.resolve("device").await.unwrap_err();
        assert!(matches!(err, VendError::DevicePostureFailed(_)));
    }

    #[tokio::test]
    async fn test_fail_open_substitutes_unknown_posture() {
        let client = PostureClient::new(
            StubProvider::failing(),
            FailMode::Open,
            Duration::from_secs(300),
        );
        let posture = client.resolve("device").await.unwrap();
        assert!(!posture.mdm_enrolled);
        assert_eq!(posture, DevicePosture::unknown());
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let client = PostureClient::new(
            StubProvider::failing(),
            FailMode::Open,
            Duration::from_secs(300),
        );
        client.resolve("device").await.unwrap();
        client.resolve("device").await.unwrap();
        assert_eq!(client.provider.calls.load(Ordering::SeqCst), 2);
    }
}
