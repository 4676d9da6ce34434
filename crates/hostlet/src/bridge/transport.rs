//! Loopback WebSocket transport.
//!
//! The pool binds `127.0.0.1` on an ephemeral port and hands the resulting
//! `ws://` endpoint to the child through [`CHILD_TRANSPORT_ADDR`]; the
//! worker runtime connects back. Frames are utf-8 text produced by the
//! envelope codec, so the transport only cares about delivery, not shape.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};

/// Environment variable carrying the pool endpoint to the child editor.
pub const CHILD_TRANSPORT_ADDR: &str = "CHILD_TRANSPORT_ADDR";

/// Environment variable asking the worker to mirror lifecycle events to stderr.
pub const POOL_DEBUG: &str = "POOL_DEBUG";

/// Accepted client socket on the pool side.
pub type ServerSocket = WebSocketStream<TcpStream>;

/// Outbound connection on the worker side.
pub type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind loopback listener: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to accept client connection: {0}")]
    Accept(String),
    #[error("timed out waiting for the client connection")]
    AcceptTimeout,
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
}

/// Loopback listener owning the session's ephemeral port.
pub struct PoolListener {
    listener: TcpListener,
    endpoint: String,
}

impl PoolListener {
    /// Bind `127.0.0.1:0`. The endpoint is only reachable from this host.
    pub async fn bind() -> Result<Self, TransportError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(TransportError::Bind)?;
        let port = listener.local_addr().map_err(TransportError::Bind)?.port();
        let endpoint = format!("ws://127.0.0.1:{port}");
        tracing::debug!(%endpoint, "transport bound");
        Ok(Self { listener, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Accept the session's single expected client and complete the
    /// WebSocket handshake.
    pub async fn accept_client(&self, timeout: Duration) -> Result<ServerSocket, TransportError> {
        let (stream, peer) = tokio::time::timeout(timeout, self.listener.accept())
            .await
            .map_err(|_| TransportError::AcceptTimeout)?
            .map_err(|e| TransportError::Accept(e.to_string()))?;
        tracing::debug!(%peer, "client connected");
        accept_async(stream)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))
    }

    /// Raw accept, used by the event loop to observe (and reject)
    /// connections after the session client is established.
    pub async fn accept_raw(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }
}

/// Worker-side connect with a bound.
pub async fn connect(endpoint: &str, timeout: Duration) -> Result<ClientSocket, TransportError> {
    let connected = tokio::time::timeout(timeout, connect_async(endpoint))
        .await
        .map_err(|_| TransportError::ConnectTimeout(endpoint.to_string()))?;
    let (socket, _response) = connected.map_err(|e: tungstenite::Error| TransportError::Connect {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    Ok(socket)
}
