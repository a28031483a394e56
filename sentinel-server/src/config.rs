//! Server configuration (clap, env-backed).

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sentinel-server",
    about = "Local credentials server: per-request policy enforcement and instant revocation"
)]
pub struct ServerConfig {
    /// Unix socket path. Preferred transport; peer identity comes from
    /// kernel credentials. Mutually exclusive with --port.
    #[arg(long, env = "SENTINEL_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Loopback TCP port. Fallback transport; authentication is the
    /// bearer token only. Mutually exclusive with --socket.
    #[arg(long, env = "SENTINEL_PORT")]
    pub port: Option<u16>,

    /// Require the bearer token on the Unix socket too (it is always
    /// required on TCP).
    #[arg(long, env = "SENTINEL_REQUIRE_TOKEN", default_value_t = false)]
    pub require_token: bool,

    /// Decision-log path (JSON Lines, HMAC-signed).
    #[arg(long, env = "SENTINEL_AUDIT_LOG", default_value = "sentinel-decisions.log")]
    pub audit_log: PathBuf,

    /// Approval/break-glass expiry sweep interval, seconds. 0 disables.
    #[arg(long, env = "SENTINEL_SWEEP_INTERVAL", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Overall per-request deadline, seconds.
    #[arg(long, env = "SENTINEL_REQUEST_DEADLINE", default_value_t = 30)]
    pub request_deadline_secs: u64,

    /// Auto-approve rules as YAML (a list of {name, conditions}).
    #[arg(long, env = "SENTINEL_AUTO_APPROVE")]
    pub auto_approve: Option<String>,
}

impl ServerConfig {
    /// Resolve the transport, defaulting to a socket in the runtime dir.
    pub fn transport(&self) -> Result<Transport, String> {
        match (&self.socket, self.port) {
            (Some(_), Some(_)) => Err("--socket and --port are mutually exclusive".into()),
            (Some(path), None) => Ok(Transport::Unix(path.clone())),
            (None, Some(port)) => Ok(Transport::Tcp(port)),
            (None, None) => {
                let dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".into());
                Ok(Transport::Unix(PathBuf::from(dir).join("sentinel.sock")))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Unix(PathBuf),
    Tcp(u16),
}
