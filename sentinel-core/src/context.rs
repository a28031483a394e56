//! Per-request decision context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Caller;
use crate::posture::DevicePosture;

/// How the request entered the pipeline. Policies can require a specific
/// mode; `server` is the only one that supports instant revocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Server,
    Cli,
    CredentialProcess,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Server => "server",
            Mode::Cli => "cli",
            Mode::CredentialProcess => "credential_process",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a single evaluation sees. Built once at request entry and
/// read-only from there on.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub caller: Caller,
    pub profile: String,
    pub mode: Mode,
    pub request_time: DateTime<Utc>,
    /// Short random hex identifier unique to this vend. 8 hex chars.
    pub request_id: String,
    /// Resolved device posture, when the caller supplied a device id and
    /// the policy needed it. `None` means "posture unknown".
    pub device_posture: Option<DevicePosture>,
    /// Caller-provided session table override. Loses to a table named by
    /// the matched rule, wins over the environment default.
    pub session_table_override: Option<String>,
}

impl DecisionContext {
    pub fn new(caller: Caller, profile: impl Into<String>, mode: Mode) -> Self {
        DecisionContext {
            caller,
            profile: profile.into(),
            mode,
            request_time: Utc::now(),
            request_id: new_request_id(),
            device_posture: None,
            session_table_override: None,
        }
    }
}

/// Fresh 8-hex request id (4 random bytes).
pub fn new_request_id() -> String {
    let bytes: [u8; 4] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = new_request_id();
        assert_eq!(id.len(), 8);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn test_request_ids_are_distinct() {
        let a = new_request_id();
        let b = new_request_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [Mode::Server, Mode::Cli, Mode::CredentialProcess] {
            let json = serde_json::to_string(&mode).unwrap();
            let back: Mode = serde_json::from_str(&json).unwrap();
            assert_eq!(mode, back);
        }
        assert_eq!(
            serde_json::to_string(&Mode::CredentialProcess).unwrap(),
            "\"credential_process\""
        );
    }
}
