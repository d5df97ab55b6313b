//! In-memory LAN for tests.
//!
//! Every broadcast on a [`MockNetwork`] reaches all listeners on that port,
//! the sender's own listener included, just as a real broadcast does.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use localnet_types::ConnectivityState;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};

use crate::error::DiscoveryError;
use crate::{BroadcastTransport, ConnectivityMonitor, Datagram};

const CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// MockNetwork
// ---------------------------------------------------------------------------

/// A shared broadcast domain.
#[derive(Clone)]
pub struct MockNetwork {
    tx: broadcast::Sender<(u16, Datagram)>,
}

impl MockNetwork {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    /// A transport for a node with the given address.
    pub fn node(&self, address: impl Into<String>) -> MockBroadcast {
        MockBroadcast {
            tx: self.tx.clone(),
            address: Arc::new(Mutex::new(Some(address.into()))),
        }
    }

    /// Deliver a raw datagram to every listener on `port`.
    pub fn inject(&self, port: u16, payload: &[u8], sender: &str) {
        let _ = self.tx.send((
            port,
            Datagram {
                payload: payload.to_vec(),
                sender: sender.to_string(),
            },
        ));
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// MockBroadcast
// ---------------------------------------------------------------------------

/// One node's view of a [`MockNetwork`].
#[derive(Clone)]
pub struct MockBroadcast {
    tx: broadcast::Sender<(u16, Datagram)>,
    address: Arc<Mutex<Option<String>>>,
}

impl MockBroadcast {
    /// Change (or remove) this node's address.
    pub fn set_local_address(&self, address: Option<String>) {
        *self.address.lock().unwrap_or_else(PoisonError::into_inner) = address;
    }
}

#[async_trait]
impl BroadcastTransport for MockBroadcast {
    async fn send_broadcast(&self, payload: &[u8], port: u16) -> Result<(), DiscoveryError> {
        let sender = self.local_address().ok_or(DiscoveryError::NoLocalAddress)?;
        // No listeners is not an error on a real LAN either.
        let _ = self.tx.send((
            port,
            Datagram {
                payload: payload.to_vec(),
                sender,
            },
        ));
        Ok(())
    }

    async fn listen(&self, port: u16) -> Result<mpsc::Receiver<Datagram>, DiscoveryError> {
        let mut inbound = self.tx.subscribe();
        let (tx, rx) = mpsc::channel(CAPACITY);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    received = inbound.recv() => match received {
                        Ok((p, datagram)) if p == port => {
                            if tx.send(datagram).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(rx)
    }

    fn local_address(&self) -> Option<String> {
        self.address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ---------------------------------------------------------------------------
// MockConnectivity
// ---------------------------------------------------------------------------

/// Connectivity driven by the test.
pub struct MockConnectivity {
    tx: watch::Sender<ConnectivityState>,
}

impl MockConnectivity {
    pub fn new(state: ConnectivityState) -> Self {
        let (tx, _) = watch::channel(state);
        Self { tx }
    }

    pub fn set(&self, state: ConnectivityState) {
        self.tx.send_replace(state);
    }
}

impl ConnectivityMonitor for MockConnectivity {
    fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}
