//! The election engine: heartbeats out, heartbeats in, periodic election.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use localnet_types::Heartbeat;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::candidate::{Candidate, CandidateSet};
use crate::wire::{decode_heartbeat, encode_heartbeat, DEFAULT_DISCOVERY_PORT};
use crate::{BroadcastTransport, Datagram};

/// Timings and port for the election engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub election_interval: Duration,
    /// Candidates silent for longer than this are dropped.
    pub candidate_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            heartbeat_interval: Duration::from_millis(1000),
            election_interval: Duration::from_millis(3000),
            candidate_timeout: Duration::from_millis(4000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SessionAdvert {
    active: bool,
    updated_at: Option<i64>,
}

struct Shared {
    transport: Arc<dyn BroadcastTransport>,
    config: ElectionConfig,
    candidates: Mutex<CandidateSet>,
    advert: Mutex<SessionAdvert>,
    host_tx: watch::Sender<String>,
}

/// Tracks peers from their heartbeats and elects one of them as host.
///
/// The current host address is published on a watch channel; an empty
/// string means no host is known.
pub struct ElectionEngine {
    shared: Arc<Shared>,
    run: Mutex<Option<CancellationToken>>,
}

impl ElectionEngine {
    pub fn new(transport: Arc<dyn BroadcastTransport>, config: ElectionConfig) -> Self {
        let (host_tx, _) = watch::channel(String::new());
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                candidates: Mutex::new(CandidateSet::new()),
                advert: Mutex::new(SessionAdvert::default()),
                host_tx,
            }),
            run: Mutex::new(None),
        }
    }

    /// Spawn the listener, heartbeat and election tasks.
    ///
    /// Returns `false` without doing anything if already running. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut run = lock(&self.run);
        if run.as_ref().is_some_and(|token| !token.is_cancelled()) {
            debug!("election engine already running");
            return false;
        }

        let token = CancellationToken::new();
        tokio::spawn(listen_loop(self.shared.clone(), token.clone()));
        tokio::spawn(heartbeat_loop(self.shared.clone(), token.clone()));
        tokio::spawn(election_loop(self.shared.clone(), token.clone()));
        *run = Some(token);

        info!(port = self.shared.config.port, "election engine started");
        true
    }

    pub fn stop(&self) {
        if let Some(token) = lock(&self.run).take() {
            token.cancel();
            info!("election engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.run)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Subscribe to host changes.
    pub fn host_receiver(&self) -> watch::Receiver<String> {
        self.shared.host_tx.subscribe()
    }

    /// The last published host, if any.
    pub fn current_host(&self) -> Option<String> {
        let host = self.shared.host_tx.borrow();
        (!host.is_empty()).then(|| host.clone())
    }

    /// Forget every host claim and publish "no host".
    pub fn clear_host(&self) {
        lock(&self.shared.candidates).clear_host();
        self.shared.host_tx.send_replace(String::new());
        info!("host cleared");
    }

    /// Update the session state advertised in our heartbeats.
    pub fn set_session_state(&self, active: bool, updated_at: Option<i64>) {
        *lock(&self.shared.advert) = SessionAdvert { active, updated_at };
    }

    /// Known candidates, sorted by address.
    pub fn candidates(&self) -> Vec<Candidate> {
        lock(&self.shared.candidates).snapshot()
    }
}

impl Drop for ElectionEngine {
    fn drop(&mut self) {
        if let Some(token) = lock(&self.run).take() {
            token.cancel();
        }
    }
}

impl Shared {
    fn handle_datagram(&self, datagram: &Datagram) {
        let heartbeat = match decode_heartbeat(&datagram.payload) {
            Ok(hb) => hb,
            Err(e) => {
                debug!(sender = %datagram.sender, error = %e, "dropping malformed heartbeat");
                return;
            }
        };
        trace!(sender = %heartbeat.sender_address, "heartbeat received");

        let host = {
            let mut candidates = lock(&self.candidates);
            candidates.observe(&heartbeat, Instant::now());
            candidates.host().map(str::to_owned)
        };
        if let Some(host) = host {
            self.publish_host(host);
        }
    }

    async fn send_heartbeat(&self) {
        let Some(local) = self.transport.local_address() else {
            trace!("no local address, skipping heartbeat");
            return;
        };
        let claimed_host = lock(&self.candidates).host().map(str::to_owned);
        let advert = *lock(&self.advert);

        let heartbeat = Heartbeat {
            sender_address: local,
            claimed_host,
            has_active_session: advert.active,
            last_session_update: advert.updated_at,
        };
        let payload = match encode_heartbeat(&heartbeat) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode heartbeat");
                return;
            }
        };
        if let Err(e) = self.transport.send_broadcast(&payload, self.config.port).await {
            warn!(error = %e, "heartbeat broadcast failed");
        }
    }

    fn election_tick(&self) {
        let winner = {
            let mut candidates = lock(&self.candidates);
            for address in candidates.remove_expired(Instant::now(), self.config.candidate_timeout) {
                debug!(addr = %address, "candidate expired");
            }
            if candidates.needs_election() {
                candidates.run_election()
            } else {
                None
            }
        };
        if let Some(winner) = winner {
            info!(host = %winner, "elected host");
            self.publish_host(winner);
        }
    }

    fn publish_host(&self, host: String) {
        self.host_tx.send_if_modified(|current| {
            if *current == host {
                return false;
            }
            info!(host = %host, "host changed");
            *current = host;
            true
        });
    }
}

async fn listen_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        match shared.transport.listen(shared.config.port).await {
            Ok(rx) => {
                if drain(&shared, rx, &shutdown).await {
                    return;
                }
                debug!("heartbeat receiver closed, reopening");
            }
            Err(e) => warn!(error = %e, "failed to listen for heartbeats"),
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(shared.config.heartbeat_interval) => {}
        }
    }
}

/// Returns `true` once shut down, `false` if the receiver closed.
async fn drain(
    shared: &Shared,
    mut rx: mpsc::Receiver<Datagram>,
    shutdown: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return true,
            datagram = rx.recv() => match datagram {
                Some(datagram) => shared.handle_datagram(&datagram),
                None => return false,
            },
        }
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => shared.send_heartbeat().await,
        }
    }
}

async fn election_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let period = shared.config.election_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => shared.election_tick(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNetwork;

    fn engine(network: &MockNetwork, address: &str) -> ElectionEngine {
        ElectionEngine::new(Arc::new(network.node(address)), ElectionConfig::default())
    }

    fn host_of(engine: &ElectionEngine) -> String {
        engine.host_receiver().borrow().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn session_holder_is_elected_everywhere() {
        let network = MockNetwork::new();
        let a = engine(&network, "10.0.0.1");
        let b = engine(&network, "10.0.0.2");
        let c = engine(&network, "10.0.0.3");
        a.set_session_state(true, Some(100));
        b.set_session_state(true, Some(200));
        for e in [&a, &b, &c] {
            assert!(e.start());
        }

        tokio::time::sleep(Duration::from_millis(5000)).await;

        for e in [&a, &b, &c] {
            assert_eq!(host_of(e), "10.0.0.2");
        }
        assert_eq!(a.candidates().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn host_loss_moves_the_role() {
        let network = MockNetwork::new();
        let a = engine(&network, "10.0.0.1");
        let b = engine(&network, "10.0.0.2");
        let c = engine(&network, "10.0.0.3");
        a.set_session_state(true, Some(100));
        b.set_session_state(true, Some(200));
        for e in [&a, &b, &c] {
            e.start();
        }
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(host_of(&a), "10.0.0.2");

        b.stop();
        a.clear_host();
        c.clear_host();
        tokio::time::sleep(Duration::from_millis(9000)).await;

        assert_eq!(host_of(&a), "10.0.0.1");
        assert_eq!(host_of(&c), "10.0.0.1");
        assert!(a.candidates().iter().all(|c| c.address != "10.0.0.2"));
    }

    #[tokio::test(start_paused = true)]
    async fn rank_decides_without_sessions() {
        let network = MockNetwork::new();
        let a = engine(&network, "10.0.0.10");
        let c = engine(&network, "10.0.0.30");
        a.start();
        c.start();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(host_of(&a), "10.0.0.30");
        assert_eq!(a.current_host().as_deref(), Some("10.0.0.30"));
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let network = MockNetwork::new();
        let observer = network.node("10.0.0.99");
        let mut rx = observer.listen(DEFAULT_DISCOVERY_PORT).await.unwrap();

        let a = engine(&network, "10.0.0.1");
        assert!(a.start());
        assert!(!a.start());
        assert!(a.is_running());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        a.stop();
        assert!(!a.is_running());

        let mut heartbeats = 0;
        while rx.try_recv().is_ok() {
            heartbeats += 1;
        }
        assert!((3..=4).contains(&heartbeats), "got {heartbeats}");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_heartbeats_are_ignored() {
        let network = MockNetwork::new();
        let a = engine(&network, "10.0.0.7");
        a.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        network.inject(DEFAULT_DISCOVERY_PORT, b"not json", "10.0.0.66");
        network.inject(DEFAULT_DISCOVERY_PORT, br#"{"senderIp":1}"#, "10.0.0.66");

        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(host_of(&a), "10.0.0.7");
        assert_eq!(a.candidates().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_address_means_no_heartbeats() {
        let network = MockNetwork::new();
        let node = network.node("10.0.0.5");
        node.set_local_address(None);
        let a = ElectionEngine::new(Arc::new(node.clone()), ElectionConfig::default());
        a.start();
        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert!(a.candidates().is_empty());
        assert_eq!(a.current_host(), None);

        node.set_local_address(Some("10.0.0.5".to_string()));
        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(a.current_host().as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_host_publishes_empty() {
        let network = MockNetwork::new();
        let a = engine(&network, "10.0.0.1");
        a.start();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(a.current_host().as_deref(), Some("10.0.0.1"));

        let mut rx = a.host_receiver();
        rx.borrow_and_update();
        a.clear_host();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), "");
        assert!(a.candidates().iter().all(|c| !c.is_host));
    }
}
