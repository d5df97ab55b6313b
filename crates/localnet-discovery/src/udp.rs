//! Default adapters for desktop targets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};

use async_trait::async_trait;
use localnet_types::ConnectivityState;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::DiscoveryError;
use crate::wire::MAX_DATAGRAM_SIZE;
use crate::{BroadcastTransport, ConnectivityMonitor, Datagram};

/// Address used only to pick the outbound interface. Nothing is sent to it.
const PROBE_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 0, 2, 1), 9);

/// IPv4 broadcast over UDP.
#[derive(Debug, Clone, Default)]
pub struct UdpBroadcast {
    address_override: Option<Ipv4Addr>,
}

impl UdpBroadcast {
    /// Detect the local address from the routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Always report `address` as the local address.
    pub fn with_address(address: Ipv4Addr) -> Self {
        Self {
            address_override: Some(address),
        }
    }

    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        self.address_override.or_else(detect_local_ipv4)
    }
}

/// The outbound IPv4 address, found by connecting an unbound UDP socket.
pub fn detect_local_ipv4() -> Option<Ipv4Addr> {
    let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(PROBE_ADDR).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Broadcast address for `local`, assuming a /24 network.
pub fn broadcast_address(local: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = local.octets();
    Ipv4Addr::new(a, b, c, 255)
}

#[async_trait]
impl BroadcastTransport for UdpBroadcast {
    async fn send_broadcast(&self, payload: &[u8], port: u16) -> Result<(), DiscoveryError> {
        let local = self.local_ipv4().ok_or(DiscoveryError::NoLocalAddress)?;
        let target = SocketAddr::from((broadcast_address(local), port));

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| DiscoveryError::Bind(e.to_string()))?;
        socket
            .set_broadcast(true)
            .map_err(|e| DiscoveryError::Send(e.to_string()))?;
        socket
            .send_to(payload, target)
            .await
            .map_err(|e| DiscoveryError::Send(format!("{target}: {e}")))?;
        trace!(target = %target, bytes = payload.len(), "broadcast sent");
        Ok(())
    }

    async fn listen(&self, port: u16) -> Result<mpsc::Receiver<Datagram>, DiscoveryError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|e| DiscoveryError::Bind(format!("port {port}: {e}")))?;
        debug!(port, "listening for broadcasts");

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => {
                            let datagram = Datagram {
                                payload: buf[..len].to_vec(),
                                sender: from.ip().to_string(),
                            };
                            if tx.send(datagram).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(port, error = %e, "broadcast receive failed");
                            break;
                        }
                    },
                }
            }
            debug!(port, "broadcast listener closed");
        });
        Ok(rx)
    }

    fn local_address(&self) -> Option<String> {
        self.local_ipv4().map(|ip| ip.to_string())
    }
}

/// Connectivity set by the embedder. Starts out connected.
pub struct StaticConnectivity {
    tx: watch::Sender<ConnectivityState>,
}

impl StaticConnectivity {
    pub fn new() -> Self {
        Self::with_state(ConnectivityState::Connected)
    }

    pub fn with_state(state: ConnectivityState) -> Self {
        let (tx, _) = watch::channel(state);
        Self { tx }
    }

    pub fn set(&self, state: ConnectivityState) {
        self.tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }
}

impl Default for StaticConnectivity {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor for StaticConnectivity {
    fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}
