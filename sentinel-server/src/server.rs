//! Transport binding and server lifecycle.
//!
//! Two mutually exclusive transports: a Unix socket (peer identity from
//! kernel credentials) and loopback TCP (bearer token only). Either way
//! the server binds, announces its endpoint to the launcher on stdout as
//! one JSON line, serves until signaled, and releases the socket or port
//! on every exit path — the socket file removal rides a drop guard.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::connect_info::{ConnectInfo, Connected};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::serve::IncomingStream;
use serde_json::json;
use tokio::net::{TcpListener, UnixListener};

use crate::config::Transport;
use crate::handlers::{ClientIdentity, FetchParams, ServerState, handle_fetch};

/// Peer identity harvested from a Unix-socket connection.
#[derive(Debug, Clone)]
pub struct UdsConnectInfo {
    pub uid: u32,
    pub pid: u32,
}

impl Connected<IncomingStream<'_, UnixListener>> for UdsConnectInfo {
    fn connect_info(stream: IncomingStream<'_, UnixListener>) -> Self {
        match stream.io().peer_cred() {
            Ok(cred) => UdsConnectInfo {
                uid: cred.uid(),
                pid: cred.pid().map(|p| p as u32).unwrap_or(0),
            },
            Err(err) => {
                // No credentials means no access: uid u32::MAX matches no
                // server owner.
                tracing::warn!(%err, "peer credentials unavailable");
                UdsConnectInfo { uid: u32::MAX, pid: 0 }
            }
        }
    }
}

/// Removes the socket file when the server exits, however it exits.
struct SocketGuard {
    path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), %err, "socket cleanup failed");
            }
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn credentials_uds(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(info): ConnectInfo<UdsConnectInfo>,
    Query(params): Query<FetchParams>,
    headers: HeaderMap,
) -> Response {
    let client = ClientIdentity {
        uid: Some(info.uid),
        pid: info.pid,
        rate_key: format!("pid:{}", info.pid),
    };
    handle_fetch(&state, client, params, &headers).await
}

async fn credentials_tcp(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<FetchParams>,
    headers: HeaderMap,
) -> Response {
    let client = ClientIdentity {
        uid: None,
        pid: 0,
        rate_key: format!("addr:{}", addr.ip()),
    };
    handle_fetch(&state, client, params, &headers).await
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/credentials", get(credentials_uds))
        .with_state(state)
}

fn router_tcp(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/credentials", get(credentials_tcp))
        .with_state(state)
}

/// Bind, announce, serve until signaled.
pub async fn run(transport: Transport, state: Arc<ServerState>) -> Result<()> {
    match transport {
        Transport::Unix(path) => serve_unix(&path, state).await,
        Transport::Tcp(port) => serve_tcp(port, state).await,
    }
}

async fn serve_unix(path: &Path, state: Arc<ServerState>) -> Result<()> {
    // A stale socket from a dead process would make bind fail; a live one
    // must not be stolen. Connectable means live.
    if path.exists() {
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            anyhow::bail!("another server is already listening on {}", path.display());
        }
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding unix socket {}", path.display()))?;
    let _guard = SocketGuard { path: path.to_path_buf() };

    announce(&json!({
        "transport": "unix",
        "endpoint": path.display().to_string(),
        "token": state.token.reveal(),
    }));
    tracing::info!(path = %path.display(), "serving credentials on unix socket");

    let app = router(Arc::clone(&state))
        .into_make_service_with_connect_info::<UdsConnectInfo>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("unix server failed")?;

    tracing::info!("server stopped");
    Ok(())
}

async fn serve_tcp(port: u16, state: Arc<ServerState>) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding loopback port {port}"))?;
    let local = listener.local_addr().context("reading bound address")?;

    announce(&json!({
        "transport": "tcp",
        "endpoint": local.to_string(),
        "token": state.token.reveal(),
    }));
    tracing::info!(%local, "serving credentials on loopback tcp");

    let app = router_tcp(Arc::clone(&state))
        .into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("tcp server failed")?;

    tracing::info!("server stopped");
    Ok(())
}

/// The launcher reads exactly one JSON line from stdout.
fn announce(endpoint: &serde_json::Value) {
    println!("{endpoint}");
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_guard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.sock");
        std::fs::write(&path, b"").unwrap();
        {
            let _guard = SocketGuard { path: path.clone() };
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_socket_guard_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-created.sock");
        let _guard = SocketGuard { path };
        // Drop must not panic.
    }
}
