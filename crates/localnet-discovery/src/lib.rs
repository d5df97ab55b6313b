//! UDP broadcast discovery and host election for localnet.
//!
//! Defines the [`BroadcastTransport`] and [`ConnectivityMonitor`] traits that
//! platform adapters implement, the candidate bookkeeping and deterministic
//! election rules, and the [`ElectionEngine`] that runs them on a schedule.
//! A UDP adapter for desktop targets lives in [`udp`].

use async_trait::async_trait;
use localnet_types::ConnectivityState;
use tokio::sync::{mpsc, watch};

pub mod candidate;
pub mod election;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod udp;
pub mod wire;

pub use candidate::{elect, rank_of, Candidate, CandidateSet};
pub use election::{ElectionConfig, ElectionEngine};
pub use error::DiscoveryError;
pub use udp::{StaticConnectivity, UdpBroadcast};

/// A datagram received on the discovery port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    /// Address of the sending node, as reported by the socket.
    pub sender: String,
}

/// Sends and receives broadcast datagrams on the local network.
///
/// Implementations are shared between the heartbeat sender and listener
/// tasks, so every method takes `&self`.
#[async_trait]
pub trait BroadcastTransport: Send + Sync + 'static {
    /// Broadcast `payload` to every node listening on `port`.
    async fn send_broadcast(&self, payload: &[u8], port: u16) -> Result<(), DiscoveryError>;

    /// Start receiving datagrams on `port`.
    ///
    /// Each call opens a fresh receiver; dropping it stops the underlying
    /// reader. Callers restart by calling `listen` again.
    async fn listen(&self, port: u16) -> Result<mpsc::Receiver<Datagram>, DiscoveryError>;

    /// This node's address on the local network, if it has one.
    fn local_address(&self) -> Option<String>;
}

/// Reports whether the node is attached to the local network.
pub trait ConnectivityMonitor: Send + Sync + 'static {
    /// Subscribe to connectivity changes. The current state is readable
    /// immediately via `borrow()`.
    fn watch(&self) -> watch::Receiver<ConnectivityState>;
}
