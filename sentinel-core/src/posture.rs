//! Device posture model and device-id derivation.
//!
//! The posture itself is resolved out of process (MDM provider); this
//! module holds the data shape, the version comparison used by policy
//! device conditions, and the client-side device-id derivation. The server
//! never derives ids — it only looks them up.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Fixed, public derivation key. This is a namespace separator, not a
/// secret: the device id must be stable across reinstalls and derivable by
/// any client from the machine identifier alone.
const DEVICE_ID_KEY: &[u8] = b"sentinel-device-id-v1";

/// Resolved device posture as reported by the MDM provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicePosture {
    pub mdm_enrolled: bool,
    pub mdm_compliant: bool,
    pub disk_encrypted: bool,
    pub firewall_enabled: bool,
    #[serde(default)]
    pub os_type: String,
    #[serde(default)]
    pub os_version: String,
}

impl DevicePosture {
    /// The posture a fail-open disposition substitutes when the provider
    /// is unreachable: unenrolled, everything else zero. Rules decide what
    /// that means.
    pub fn unknown() -> Self {
        DevicePosture::default()
    }
}

/// Derive the 32-char lowercase hex device id from a stable machine
/// identifier. HMAC-SHA-256 truncated to 16 bytes.
pub fn derive_device_id(machine_id: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(DEVICE_ID_KEY)
        .expect("HMAC accepts any key length");
    mac.update(machine_id.trim().as_bytes());
    let digest = mac.finalize().into_bytes();
    hex::encode(&digest[..16])
}

/// Whether a string is a well-formed device id: exactly 32 lowercase hex.
pub fn is_valid_device_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Parse a dotted numeric version into its components. Empty and
/// non-numeric segments fail the parse.
pub fn parse_version(v: &str) -> Option<Vec<u64>> {
    let parts: Vec<u64> = v
        .split('.')
        .map(|seg| seg.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() { None } else { Some(parts) }
}

/// Compare dotted versions component-wise; missing components count as
/// zero, so "14.1" >= "14.1.0". Returns `None` when either side fails to
/// parse — callers treat that as "condition not satisfied".
pub fn version_at_least(actual: &str, minimum: &str) -> Option<bool> {
    let a = parse_version(actual)?;
    let m = parse_version(minimum)?;
    let len = a.len().max(m.len());
    for i in 0..len {
        let av = a.get(i).copied().unwrap_or(0);
        let mv = m.get(i).copied().unwrap_or(0);
        if av != mv {
            return Some(av > mv);
        }
    }
    Some(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_shape() {
        let id = derive_device_id("io.platform.uuid:1234-5678");
        assert_eq!(id.len(), 32);
        assert!(is_valid_device_id(&id));
    }

    #[test]
    fn test_device_id_stable() {
        assert_eq!(derive_device_id("machine-a"), derive_device_id("machine-a"));
        assert_ne!(derive_device_id("machine-a"), derive_device_id("machine-b"));
    }

    #[test]
    fn test_device_id_trims_whitespace() {
        assert_eq!(derive_device_id(" machine-a \n"), derive_device_id("machine-a"));
    }

    #[test]
    fn test_is_valid_device_id() {
        assert!(is_valid_device_id(&"a1".repeat(16)));
        assert!(!is_valid_device_id("short"));
        assert!(!is_valid_device_id(&"A1".repeat(16)));
        assert!(!is_valid_device_id(&"g1".repeat(16)));
    }

    #[test]
    fn test_version_compare() {
        assert_eq!(version_at_least("14.2", "14.1"), Some(true));
        assert_eq!(version_at_least("14.1", "14.1"), Some(true));
        assert_eq!(version_at_least("14.0.9", "14.1"), Some(false));
        assert_eq!(version_at_least("14.1", "14.1.0"), Some(true));
        assert_eq!(version_at_least("15", "14.9.9"), Some(true));
        assert_eq!(version_at_least("10.16", "10.9"), Some(true));
    }

    #[test]
    fn test_version_compare_unparseable() {
        assert_eq!(version_at_least("Sonoma", "14.1"), None);
        assert_eq!(version_at_least("14.1", ""), None);
        assert_eq!(version_at_least("14.x", "14.1"), None);
    }
}
