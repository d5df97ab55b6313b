//! WebSocket transport: bind, accept, upgrade, and connect.

use std::io;
use std::net::SocketAddr;

use localnet_types::PeerId;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::ProtocolError;
use crate::wire::{peer_id_from_query, session_url, SESSION_PATH};

/// Server side of an upgraded session.
pub type ServerStream = WebSocketStream<TcpStream>;

/// Client side of an upgraded session.
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Listening socket of the session hub.
pub struct SessionListener {
    listener: TcpListener,
}

impl SessionListener {
    /// Bind the session endpoint.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProtocolError::Connection(format!("bind {addr}: {e}")))?;
        info!(addr = %addr, "session listener bound");
        Ok(Self { listener })
    }

    /// Accept the next TCP connection. The WebSocket upgrade is left to
    /// [`IncomingSession::upgrade`] so a slow peer never stalls the accept loop.
    pub async fn accept(&self) -> Result<IncomingSession, ProtocolError> {
        let (stream, remote) = self
            .listener
            .accept()
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        debug!(remote = %remote, "accepted connection");
        Ok(IncomingSession { stream, remote })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        self.listener
            .local_addr()
            .map_err(|e| ProtocolError::Connection(e.to_string()))
    }
}

/// A TCP connection waiting for its WebSocket upgrade.
pub struct IncomingSession {
    stream: TcpStream,
    remote: SocketAddr,
}

impl IncomingSession {
    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// Perform the upgrade handshake and identify the peer.
    ///
    /// Requests for any path other than the session path are refused with
    /// 404. A request without an `id` parameter is identified by the last
    /// component of its remote address.
    pub async fn upgrade(self) -> Result<(PeerId, ServerStream), ProtocolError> {
        let mut requested_id = None;
        let callback = |request: &Request, response: Response| {
            if request.uri().path() != SESSION_PATH {
                let mut refusal = ErrorResponse::new(Some("unknown path".to_string()));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                return Err(refusal);
            }
            requested_id = peer_id_from_query(request.uri().query());
            Ok(response)
        };

        let ws = tokio_tungstenite::accept_hdr_async(self.stream, callback)
            .await
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

        let id = requested_id.unwrap_or_else(|| PeerId::from_address(&self.remote.ip().to_string()));
        debug!(peer = %id, remote = %self.remote, "session upgraded");
        Ok((id, ws))
    }
}

/// Open a session to the hub at `host:port`, identifying as `id`.
///
/// Failures that mean the host is not (yet) reachable map to
/// [`ProtocolError::Unreachable`]; see [`ProtocolError::is_retryable`].
pub async fn connect_session(
    host: &str,
    port: u16,
    id: &PeerId,
) -> Result<ClientStream, ProtocolError> {
    let url = session_url(host, port, id);
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| match e {
            WsError::Io(io) if is_unreachable(&io) => ProtocolError::Unreachable(io.to_string()),
            other => ProtocolError::Connection(other.to_string()),
        })?;
    debug!(url = %url, "session connected");
    Ok(ws)
}

fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::AddrNotAvailable
    )
}
