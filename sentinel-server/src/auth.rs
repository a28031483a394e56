//! Local-server authentication.
//!
//! A bearer token generated at startup, compared in constant time, and
//! bound to the first client process that presents it. The comparison
//! goes through `subtle::ConstantTimeEq` — never byte-wise `==`, which
//! leaks where the first mismatch sits via response timing. A source-scan
//! test enforces that this file keeps using the constant-time primitive.

use std::sync::atomic::{AtomicU32, Ordering};

use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;

use sentinel_core::error::VendError;

/// PID sentinel meaning "no client bound yet".
const UNBOUND: u32 = 0;

/// The server's bearer token plus its process binding.
pub struct BoundToken {
    token: Vec<u8>,
    bound_pid: AtomicU32,
}

impl BoundToken {
    /// Fresh 32-byte token, base64url on the wire.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(bytes)
            .into_bytes();
        BoundToken {
            token,
            bound_pid: AtomicU32::new(UNBOUND),
        }
    }

    /// The wire form, for the startup announcement to the launcher.
    pub fn reveal(&self) -> String {
        String::from_utf8_lossy(&self.token).into_owned()
    }

    /// Verify a presented token and enforce the PID binding.
    ///
    /// `client_pid = 0` means the transport could not report a peer pid;
    /// the token check still applies but no binding is recorded.
    pub fn verify(&self, presented: &str, client_pid: u32) -> Result<(), VendError> {
        let presented = presented.as_bytes();
        // Length mismatch reveals only the length, which is public anyway
        // (every token is 43 base64url chars). Content comparison is
        // constant-time.
        if presented.len() != self.token.len() {
            return Err(VendError::Unauthorized);
        }
        if presented.ct_eq(&self.token).unwrap_u8() != 1 {
            return Err(VendError::Unauthorized);
        }

        if client_pid == UNBOUND {
            return Ok(());
        }
        // First authenticated client claims the token; everyone else with
        // the same bytes is refused from then on.
        match self
            .bound_pid
            .compare_exchange(UNBOUND, client_pid, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(bound) if bound == client_pid => Ok(()),
            Err(bound) => {
                tracing::warn!(bound, client_pid, "token presented by a different process");
                Err(VendError::Unauthorized)
            }
        }
    }

    /// The currently bound PID, 0 when unbound. For diagnostics.
    pub fn bound_pid(&self) -> u32 {
        self.bound_pid.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correct_token_accepted() {
        let token = BoundToken::generate();
        let wire = token.reveal();
        token.verify(&wire, 1234).unwrap();
    }

    #[test]
    fn test_wrong_token_rejected() {
        let token = BoundToken::generate();
        let other = BoundToken::generate();
        assert!(matches!(
            token.verify(&other.reveal(), 1234),
            Err(VendError::Unauthorized)
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let token = BoundToken::generate();
        assert!(token.verify("short", 1234).is_err());
        assert!(token.verify(&format!("{}x", token.reveal()), 1234).is_err());
    }

    #[test]
    fn test_first_client_binds() {
        let token = BoundToken::generate();
        let wire = token.reveal();
        assert_eq!(token.bound_pid(), 0);
        token.verify(&wire, 41).unwrap();
        assert_eq!(token.bound_pid(), 41);
    }

    #[test]
    fn test_same_pid_keeps_working() {
        let token = BoundToken::generate();
        let wire = token.reveal();
        token.verify(&wire, 41).unwrap();
        token.verify(&wire, 41).unwrap();
    }

    #[test]
    fn test_second_pid_rejected() {
        let token = BoundToken::generate();
        let wire = token.reveal();
        token.verify(&wire, 41).unwrap();
        assert!(matches!(token.verify(&wire, 42), Err(VendError::Unauthorized)));
        // The binding did not move.
        assert_eq!(token.bound_pid(), 41);
    }

    #[test]
    fn test_pid_zero_does_not_bind() {
        let token = BoundToken::generate();
        let wire = token.reveal();
        token.verify(&wire, 0).unwrap();
        assert_eq!(token.bound_pid(), 0);
        // A real pid can still claim it afterwards.
        token.verify(&wire, 7).unwrap();
        assert_eq!(token.bound_pid(), 7);
    }

    #[test]
    fn test_wrong_token_does_not_bind() {
        let token = BoundToken::generate();
        let other = BoundToken::generate();
        let _ = token.verify(&other.reveal(), 99);
        assert_eq!(token.bound_pid(), 0);
    }
}
