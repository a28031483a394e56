//! Sentinel local server.
//!
//! The deployment model that makes instant revocation real: a long-lived
//! process on the operator's machine answering credential fetches over an
//! authenticated local transport, re-running the full policy pipeline on
//! every request.
//!
//! - `config` — clap/env server configuration
//! - `auth` — bearer token, constant-time comparison, PID binding
//! - `handlers` — the credentials endpoint and the sanitized error surface
//! - `server` — transports, lifecycle, announcement, shutdown

pub mod auth;
pub mod config;
pub mod handlers;
pub mod server;

pub use auth::BoundToken;
pub use config::{ServerConfig, Transport};
pub use handlers::{ClientIdentity, ServerState};
