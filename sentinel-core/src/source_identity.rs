//! SourceIdentity composition and parsing.
//!
//! The four-part stamp `sentinel:<user>:<marker>:<request-id>` rides on
//! every STS session and shows up in downstream audit records. The
//! underlying protocol caps it at 64 characters; when the composed string
//! would exceed that, the username is truncated — never the marker or the
//! request id, which downstream trust policies key on.

use serde::{Deserialize, Serialize};

use crate::error::VendError;

/// Protocol limit on the SourceIdentity string.
pub const MAX_SOURCE_IDENTITY_LEN: usize = 64;

const PREFIX: &str = "sentinel";

/// The marker literal used when no approval or break-glass record was
/// involved.
pub const DIRECT_MARKER: &str = "direct";

/// A parsed (or to-be-composed) source identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub user: String,
    /// `direct`, an 8-hex approval marker, or `bg` + 6 hex.
    pub marker: String,
    /// 6–8 hex chars, unique per vend.
    pub request_id: String,
}

impl SourceIdentity {
    /// Compose, truncating the username as needed to respect the length
    /// cap. Fails when the marker and request id alone leave no room for
    /// at least one username character.
    pub fn compose(user: &str, marker: &str, request_id: &str) -> Result<SourceIdentity, VendError> {
        if !is_valid_marker(marker) {
            return Err(VendError::CredentialIssueFailed(format!(
                "invalid approval marker {marker:?}"
            )));
        }
        if !is_valid_request_id(request_id) {
            return Err(VendError::CredentialIssueFailed(format!(
                "invalid request id {request_id:?}"
            )));
        }
        if user.is_empty() || !user.bytes().all(is_identity_byte) {
            return Err(VendError::CredentialIssueFailed(
                "username not sanitized for source identity".into(),
            ));
        }

        // prefix + 3 separators + marker + request id.
        let overhead = PREFIX.len() + 3 + marker.len() + request_id.len();
        let room = MAX_SOURCE_IDENTITY_LEN.saturating_sub(overhead);
        if room == 0 {
            return Err(VendError::CredentialIssueFailed(
                "no room for username in source identity".into(),
            ));
        }
        let user = if user.len() > room { &user[..room] } else { user };

        Ok(SourceIdentity {
            user: user.to_string(),
            marker: marker.to_string(),
            request_id: request_id.to_string(),
        })
    }

    /// Parse a stamp back into its parts. The inverse of `render` for any
    /// composed identity.
    pub fn parse(s: &str) -> Result<SourceIdentity, VendError> {
        let mut parts = s.split(':');
        let prefix = parts.next().unwrap_or_default();
        let user = parts.next().unwrap_or_default();
        let marker = parts.next().unwrap_or_default();
        let request_id = parts.next().unwrap_or_default();
        if prefix != PREFIX
            || parts.next().is_some()
            || user.is_empty()
            || !user.bytes().all(is_identity_byte)
            || !is_valid_marker(marker)
            || !is_valid_request_id(request_id)
        {
            return Err(VendError::InvalidIdentity(format!(
                "malformed source identity {s:?}"
            )));
        }
        Ok(SourceIdentity {
            user: user.to_string(),
            marker: marker.to_string(),
            request_id: request_id.to_string(),
        })
    }

    /// The wire string. Guaranteed ≤ 64 chars for composed identities.
    pub fn render(&self) -> String {
        format!("{PREFIX}:{}:{}:{}", self.user, self.marker, self.request_id)
    }

    /// Whether this session came through break-glass.
    pub fn is_break_glass(&self) -> bool {
        self.marker.starts_with("bg") && self.marker != DIRECT_MARKER
    }
}

impl std::fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

fn is_identity_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `direct`, 8 lowercase hex (approval), or `bg` + 6 lowercase hex
/// (break-glass).
pub fn is_valid_marker(marker: &str) -> bool {
    if marker == DIRECT_MARKER {
        return true;
    }
    if let Some(rest) = marker.strip_prefix("bg") {
        return rest.len() == 6 && is_lower_hex(rest);
    }
    marker.len() == 8 && is_lower_hex(marker)
}

/// 6–8 lowercase hex chars.
pub fn is_valid_request_id(id: &str) -> bool {
    (6..=8).contains(&id.len()) && is_lower_hex(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_direct() {
        let si = SourceIdentity::compose("alice", DIRECT_MARKER, "a1b2c3d4").unwrap();
        assert_eq!(si.render(), "sentinel:alice:direct:a1b2c3d4");
        assert!(si.render().len() <= MAX_SOURCE_IDENTITY_LEN);
    }

    #[test]
    fn test_compose_approval_marker() {
        let si = SourceIdentity::compose("alice", "a1b2c3d4", "00ff00ff").unwrap();
        assert_eq!(si.render(), "sentinel:alice:a1b2c3d4:00ff00ff");
    }

    #[test]
    fn test_compose_break_glass_marker() {
        let si = SourceIdentity::compose("alice", "bgdeadbe", "a1b2c3").unwrap();
        assert!(si.is_break_glass());
        assert_eq!(si.render(), "sentinel:alice:bgdeadbe:a1b2c3");
    }

    #[test]
    fn test_direct_is_not_break_glass() {
        let si = SourceIdentity::compose("alice", DIRECT_MARKER, "a1b2c3d4").unwrap();
        assert!(!si.is_break_glass());
    }

    #[test]
    fn test_round_trip() {
        let si = SourceIdentity::compose("alice_dev-1", "a1b2c3d4", "cafef00d").unwrap();
        let parsed = SourceIdentity::parse(&si.render()).unwrap();
        assert_eq!(parsed, si);
        assert_eq!(parsed.user, "alice_dev-1");
        assert_eq!(parsed.marker, "a1b2c3d4");
        assert_eq!(parsed.request_id, "cafef00d");
    }

    #[test]
    fn test_long_username_truncated_not_marker() {
        let long = "a".repeat(80);
        let si = SourceIdentity::compose(&long, "a1b2c3d4", "cafef00d").unwrap();
        let rendered = si.render();
        assert!(rendered.len() <= MAX_SOURCE_IDENTITY_LEN);
        // Marker and request id survive intact.
        assert!(rendered.ends_with(":a1b2c3d4:cafef00d"));
        // Username got the truncation.
        assert!(si.user.len() < 80);
        // Still parses back.
        let parsed = SourceIdentity::parse(&rendered).unwrap();
        assert_eq!(parsed.marker, "a1b2c3d4");
        assert_eq!(parsed.request_id, "cafef00d");
    }

    #[test]
    fn test_exactly_at_limit() {
        // overhead = 8 (sentinel) + 3 + 8 + 8 = 27; room = 37.
        let user = "u".repeat(37);
        let si = SourceIdentity::compose(&user, "a1b2c3d4", "cafef00d").unwrap();
        assert_eq!(si.render().len(), MAX_SOURCE_IDENTITY_LEN);
        assert_eq!(si.user, user);
    }

    #[test]
    fn test_invalid_markers_rejected() {
        for bad in ["", "DIRECT", "a1b2c3", "a1b2c3d4e5", "bgdeadbeef", "bg12345", "zzzzzzzz"] {
            assert!(
                SourceIdentity::compose("alice", bad, "a1b2c3d4").is_err(),
                "accepted marker {bad:?}"
            );
        }
    }

    #[test]
    fn test_invalid_request_ids_rejected() {
        for bad in ["", "abc", "a1b2c3d4e5", "A1B2C3", "ghijkl"] {
            assert!(
                SourceIdentity::compose("alice", DIRECT_MARKER, bad).is_err(),
                "accepted request id {bad:?}"
            );
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "sentinel:alice:direct",
            "sentinel:alice:direct:a1b2c3d4:extra",
            "other:alice:direct:a1b2c3d4",
            "sentinel::direct:a1b2c3d4",
            "sentinel:al ice:direct:a1b2c3d4",
            "",
        ] {
            assert!(SourceIdentity::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_pattern_invariant() {
        // Every composed identity matches the audited pattern:
        // sentinel:[A-Za-z0-9_-]{1,N}:(direct|hex8|bg+hex6):[0-9a-f]{6,8}
        for marker in [DIRECT_MARKER, "a1b2c3d4", "bg00ff00"] {
            let si = SourceIdentity::compose("Some_User-9", marker, "abcdef01").unwrap();
            let rendered = si.render();
            assert!(rendered.len() <= MAX_SOURCE_IDENTITY_LEN);
            assert!(SourceIdentity::parse(&rendered).is_ok());
        }
    }
}
