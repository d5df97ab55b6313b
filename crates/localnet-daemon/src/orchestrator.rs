//! The orchestrator: follows the elected host and drives the hub and client.
//!
//! A reactor task combines connectivity with the election's host address.
//! Each change (while online, with a known host) spawns a reaction that
//! starts the local hub if this node is the host and then connects the
//! client to the host after a settle delay; a newer change cancels a
//! reaction still in progress. Two forwarders turn hub and client events
//! into envelope streams and handle host loss and peer departures.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use localnet_discovery::{BroadcastTransport, ConnectivityMonitor, ElectionEngine};
use localnet_protocol::{EnvelopeCodec, EnvelopeRegistration};
use localnet_types::{Envelope, PeerId};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::SessionClient;
use crate::config::Config;
use crate::error::DaemonError;
use crate::hub::{HubEvent, SessionHub};
use crate::state::{NodeStatus, Role};

const EVENT_CAPACITY: usize = 256;

/// This node's address and the peer id derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub address: String,
    pub id: PeerId,
}

struct Inner {
    config: Config,
    transport: Arc<dyn BroadcastTransport>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    codec: Arc<EnvelopeCodec>,
    election: ElectionEngine,
    hub: SessionHub,
    client: SessionClient,
    identity: OnceLock<Identity>,
    current_host: Mutex<Option<String>>,
    wifi_tx: watch::Sender<bool>,
    loading_tx: watch::Sender<bool>,
    status_tx: watch::Sender<NodeStatus>,
    server_tx: broadcast::Sender<Envelope>,
}

/// Discovery, election and session handling for one node.
pub struct Orchestrator {
    inner: Arc<Inner>,
    run: Mutex<Option<CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        transport: Arc<dyn BroadcastTransport>,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> Self {
        let codec = Arc::new(EnvelopeCodec::new());
        let timings = config.session_timings();
        let election = ElectionEngine::new(transport.clone(), config.election_config());
        let (wifi_tx, _) = watch::channel(connectivity.watch().borrow().is_connected());
        let (loading_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(NodeStatus::default());
        let (server_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                hub: SessionHub::new(timings),
                client: SessionClient::new(codec.clone(), timings),
                config,
                transport,
                connectivity,
                codec,
                election,
                identity: OnceLock::new(),
                current_host: Mutex::new(None),
                wifi_tx,
                loading_tx,
                status_tx,
                server_tx,
            }),
            run: Mutex::new(None),
        }
    }

    /// Start discovery and begin following the elected host.
    ///
    /// Idempotent. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut run = lock(&self.run);
        if run.is_some() {
            debug!("orchestrator already running");
            return;
        }
        let shutdown = CancellationToken::new();

        // Subscribe before anything can publish.
        let hub_events = self.inner.hub.subscribe();
        let client_events = self.inner.client.subscribe();
        let connected = self.inner.client.connected();

        self.inner.election.start();
        tokio::spawn(reactor(self.inner.clone(), shutdown.clone()));
        tokio::spawn(forward_hub_events(
            self.inner.clone(),
            hub_events,
            shutdown.clone(),
        ));
        tokio::spawn(forward_client_events(
            self.inner.clone(),
            client_events,
            shutdown.clone(),
        ));
        tokio::spawn(track_loading(self.inner.clone(), connected, shutdown.clone()));
        *run = Some(shutdown);
        info!("orchestrator started");
    }

    /// Stop every task, close the client connection and shut the hub down.
    pub async fn shutdown(&self) {
        let Some(shutdown) = lock(&self.run).take() else {
            return;
        };
        shutdown.cancel();
        self.inner.election.stop();
        self.inner.client.close();
        self.inner.hub.stop().await;
        self.inner.hub.close_all();
        *lock(&self.inner.current_host) = None;
        self.inner.refresh_status();
        info!("orchestrator stopped");
    }

    /// Connect the client to the currently elected host.
    pub async fn connect(&self) -> Result<(), DaemonError> {
        let host = lock(&self.inner.current_host)
            .clone()
            .ok_or(DaemonError::NoHost)?;
        let identity = self.inner.resolve_identity().await?;
        self.inner.connect_client(&host, &identity);
        Ok(())
    }

    /// Close every session on the local hub.
    pub fn disconnect_all(&self) {
        self.inner.hub.close_all();
        self.inner.refresh_status();
    }

    /// Send an envelope from the hub to one peer.
    pub fn send(&self, id: &str, envelope: &Envelope) -> Result<(), DaemonError> {
        let text = self.inner.codec.encode(envelope)?;
        self.inner.hub.send_to(&PeerId::new(id), &text);
        Ok(())
    }

    /// Send an envelope from the hub to every peer.
    pub fn send_to_all(&self, envelope: &Envelope) -> Result<(), DaemonError> {
        let text = self.inner.codec.encode(envelope)?;
        self.inner.hub.broadcast(&text);
        Ok(())
    }

    /// Send an envelope to the host through the client connection.
    pub fn send_from_client(&self, envelope: Envelope) {
        self.inner.client.send(envelope);
    }

    pub fn is_server_running(&self) -> bool {
        self.inner.hub.is_running()
    }

    /// This node's peer id, resolving the local address if needed.
    pub async fn device_id(&self) -> Result<PeerId, DaemonError> {
        Ok(self.inner.resolve_identity().await?.id)
    }

    pub async fn identity(&self) -> Result<Identity, DaemonError> {
        self.inner.resolve_identity().await
    }

    pub fn register_custom_envelope_types(
        &self,
        registrations: impl IntoIterator<Item = EnvelopeRegistration>,
    ) -> Result<(), DaemonError> {
        self.inner.codec.register(registrations)?;
        Ok(())
    }

    /// Advertise this node's application session in heartbeats.
    pub fn set_session_state(&self, active: bool, updated_at: i64) {
        self.inner.election.set_session_state(active, Some(updated_at));
    }

    pub fn wifi_connected(&self) -> watch::Receiver<bool> {
        self.inner.wifi_tx.subscribe()
    }

    pub fn loading(&self) -> watch::Receiver<bool> {
        self.inner.loading_tx.subscribe()
    }

    /// Hub lifecycle and every message seen by the local hub.
    pub fn server_messages(&self) -> broadcast::Receiver<Envelope> {
        self.inner.server_tx.subscribe()
    }

    /// Everything received from the host, plus host loss.
    pub fn client_messages(&self) -> broadcast::Receiver<Envelope> {
        self.inner.client.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<NodeStatus> {
        self.inner.status_tx.subscribe()
    }

    /// The host currently being followed.
    pub fn current_host(&self) -> Option<String> {
        lock(&self.inner.current_host).clone()
    }

    /// The host the election engine last published, if any.
    pub fn elected_host(&self) -> Option<String> {
        self.inner.election.current_host()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(shutdown) = lock(&self.run).take() {
            shutdown.cancel();
        }
    }
}

impl Inner {
    async fn resolve_identity(&self) -> Result<Identity, DaemonError> {
        if let Some(identity) = self.identity.get() {
            return Ok(identity.clone());
        }
        let retries = self.config.identity.address_retries;
        let delay = std::time::Duration::from_millis(self.config.identity.address_retry_delay_ms);
        for attempt in 0..=retries {
            if let Some(address) = self.transport.local_address() {
                let identity = Identity {
                    id: PeerId::from_address(&address),
                    address,
                };
                let identity = self.identity.get_or_init(|| identity).clone();
                info!(address = %identity.address, id = %identity.id, "resolved local identity");
                return Ok(identity);
            }
            if attempt < retries {
                debug!(attempt, "local address not available yet");
                tokio::time::sleep(delay).await;
            }
        }
        Err(DaemonError::LocalAddressNotFound)
    }

    fn connect_client(&self, host: &str, identity: &Identity) {
        let is_host = PeerId::from_address(host) == identity.id;
        self.client.connect(
            host,
            self.config.network.session_port,
            identity.id.clone(),
            is_host,
        );
        self.refresh_status();
    }

    /// React to a new host: host it ourselves or connect to it.
    async fn follow_host(&self, identity: &Identity, host: String) {
        *lock(&self.current_host) = Some(host.clone());
        self.refresh_status();

        if host == identity.address {
            if !self.hub.is_running() {
                let ip = identity
                    .address
                    .parse()
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                let addr = SocketAddr::new(ip, self.config.network.session_port);
                if let Err(e) = self.hub.start(addr).await {
                    error!(addr = %addr, error = %e, "failed to start session hub");
                }
                self.refresh_status();
            }
            if !self.config.daemon.host_joins_as_client {
                self.client.close();
                return;
            }
        }

        tokio::time::sleep(self.config.session_timings().settle_delay).await;
        self.connect_client(&host, identity);
    }

    /// Called when the client lost its host.
    async fn handle_host_loss(&self) {
        warn!("host lost, starting over");
        self.election.clear_host();
        *lock(&self.current_host) = None;
        self.hub.stop().await;
        self.loading_tx.send_replace(true);
        self.refresh_status();
    }

    fn map_hub_event(&self, event: HubEvent) -> Option<Envelope> {
        match event {
            HubEvent::Started => Some(Envelope::ServerStarted),
            HubEvent::Stopped => Some(Envelope::ServerDownDetected),
            HubEvent::Disconnected(id) => Some(Envelope::UserDisconnected { id: id.to_string() }),
            HubEvent::Message { from, text } => match self.codec.decode(&text) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    debug!(peer = %from, error = %e, "dropping undecodable envelope");
                    None
                }
            },
        }
    }

    fn refresh_status(&self) {
        let host = lock(&self.current_host).clone();
        let role = if self.hub.is_running() {
            Role::Host
        } else if self.client.host().is_some() {
            Role::Client
        } else {
            Role::Idle
        };
        let status = NodeStatus {
            role,
            host,
            session_count: self.hub.session_count(),
            wifi_connected: *self.wifi_tx.borrow(),
            loading: *self.loading_tx.borrow(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

async fn reactor(inner: Arc<Inner>, shutdown: CancellationToken) {
    let identity = tokio::select! {
        () = shutdown.cancelled() => return,
        identity = inner.resolve_identity() => match identity {
            Ok(identity) => identity,
            Err(e) => {
                error!(error = %e, "cannot resolve local address; not following hosts");
                return;
            }
        },
    };

    let mut connectivity = inner.connectivity.watch();
    let mut hosts = inner.election.host_receiver();
    let mut last: Option<(bool, String)> = None;
    let mut pending: Option<CancellationToken> = None;

    loop {
        let online = connectivity.borrow_and_update().is_connected();
        let host = hosts.borrow_and_update().clone();
        inner.wifi_tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });

        let observed = (online, host.clone());
        if last.as_ref() != Some(&observed) {
            last = Some(observed);
            if online && !host.is_empty() {
                if let Some(previous) = pending.take() {
                    previous.cancel();
                }
                let reaction = shutdown.child_token();
                pending = Some(reaction.clone());
                let inner = inner.clone();
                let identity = identity.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        () = reaction.cancelled() => debug!("host reaction superseded"),
                        () = inner.follow_host(&identity, host) => {}
                    }
                });
            }
        }
        inner.refresh_status();

        tokio::select! {
            () = shutdown.cancelled() => break,
            changed = connectivity.changed() => if changed.is_err() { break },
            changed = hosts.changed() => if changed.is_err() { break },
        }
    }
    debug!("reactor stopped");
}

async fn forward_hub_events(
    inner: Arc<Inner>,
    mut events: broadcast::Receiver<HubEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "hub events lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(envelope) = inner.map_hub_event(event) else {
            continue;
        };
        if let Envelope::UserDisconnected { id } = &envelope {
            inner.hub.close_session(&PeerId::new(id.as_str()));
        }
        let _ = inner.server_tx.send(envelope);
        inner.refresh_status();
    }
}

async fn forward_client_events(
    inner: Arc<Inner>,
    mut events: broadcast::Receiver<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(Envelope::ServerDownDetected) => inner.handle_host_loss().await,
            Ok(Envelope::UserDisconnected { id }) => {
                inner.hub.close_session(&PeerId::new(id));
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "client events lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Loading mirrors the client: waiting whenever it is not connected.
async fn track_loading(
    inner: Arc<Inner>,
    mut connected: watch::Receiver<bool>,
    shutdown: CancellationToken,
) {
    loop {
        let is_connected = *connected.borrow_and_update();
        inner.loading_tx.send_if_modified(|loading| {
            let changed = *loading == is_connected;
            *loading = !is_connected;
            changed
        });
        inner.refresh_status();

        tokio::select! {
            () = shutdown.cancelled() => break,
            changed = connected.changed() => if changed.is_err() { break },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
