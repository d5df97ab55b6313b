//! Session hub: the host side of the session channel.
//!
//! Each accepted peer gets a writer task (outbound queue plus keep-alive
//! pings) and a reader task (inbound frames, relay, idle timeout). Sessions
//! are keyed by peer id in a single map; whoever removes an entry from the
//! map is responsible for announcing the disconnect, so each session is
//! announced at most once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use localnet_protocol::{normal_close, ServerStream, SessionListener};
use localnet_types::PeerId;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SessionTimings;
use crate::error::DaemonError;

const EVENT_CAPACITY: usize = 256;

/// Something that happened on the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    Started,
    Stopped,
    /// A text frame from a peer. It has already been relayed to the others.
    Message { from: PeerId, text: String },
    /// A session was removed.
    Disconnected(PeerId),
}

struct SessionHandle {
    serial: u64,
    outbound: mpsc::UnboundedSender<Message>,
    close: CancellationToken,
}

struct Running {
    shutdown: CancellationToken,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

struct HubShared {
    sessions: Mutex<HashMap<PeerId, SessionHandle>>,
    events: broadcast::Sender<HubEvent>,
    timings: SessionTimings,
    next_serial: AtomicU64,
}

/// Accepts peers and multiplexes messages between them.
pub struct SessionHub {
    shared: Arc<HubShared>,
    state: Mutex<Option<Running>>,
    /// Serialises `start` and `stop`.
    lifecycle: tokio::sync::Mutex<()>,
}

impl SessionHub {
    pub fn new(timings: SessionTimings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(HubShared {
                sessions: Mutex::new(HashMap::new()),
                events,
                timings,
                next_serial: AtomicU64::new(0),
            }),
            state: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.shared.events.subscribe()
    }

    /// Start accepting peers on `addr`. Returns the bound address.
    ///
    /// If the hub is already running this does nothing and returns the
    /// address it is running on.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr, DaemonError> {
        let _guard = self.lifecycle.lock().await;
        if let Some(running) = lock(&self.state).as_ref() {
            debug!(addr = %running.local_addr, "session hub already running");
            return Ok(running.local_addr);
        }

        let listener = SessionListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            self.shared.clone(),
            listener,
            shutdown.clone(),
        ));
        *lock(&self.state) = Some(Running {
            shutdown,
            local_addr,
            accept_task,
        });

        info!(addr = %local_addr, "session hub started");
        self.shared.emit(HubEvent::Started);
        Ok(local_addr)
    }

    /// Stop accepting peers. Open sessions are left alone; see
    /// [`close_all`](Self::close_all).
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let Some(running) = lock(&self.state).take() else {
            debug!("session hub not running");
            return;
        };
        running.shutdown.cancel();
        if let Err(e) = running.accept_task.await {
            warn!(error = %e, "accept task failed");
        }
        info!(addr = %running.local_addr, "session hub stopped");
        self.shared.emit(HubEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.state).as_ref().map(|r| r.local_addr)
    }

    /// Queue `text` for one peer. Unknown peers are ignored.
    pub fn send_to(&self, id: &PeerId, text: &str) {
        match lock(&self.shared.sessions).get(id) {
            Some(handle) => {
                let _ = handle.outbound.send(Message::text(text.to_string()));
            }
            None => trace!(peer = %id, "send to unknown peer dropped"),
        }
    }

    /// Queue `text` for every peer.
    pub fn broadcast(&self, text: &str) {
        for handle in lock(&self.shared.sessions).values() {
            let _ = handle.outbound.send(Message::text(text.to_string()));
        }
    }

    /// Close one session, announcing its disconnect if it was still open.
    pub fn close_session(&self, id: &PeerId) {
        let removed = lock(&self.shared.sessions).remove(id);
        if let Some(handle) = removed {
            handle.close.cancel();
            info!(peer = %id, "session closed by hub");
            self.shared.emit(HubEvent::Disconnected(id.clone()));
        }
    }

    /// Close every session.
    pub fn close_all(&self) {
        let removed: Vec<(PeerId, SessionHandle)> = lock(&self.shared.sessions).drain().collect();
        for (id, handle) in removed {
            handle.close.cancel();
            info!(peer = %id, "session closed by hub");
            self.shared.emit(HubEvent::Disconnected(id));
        }
    }

    pub fn session_count(&self) -> usize {
        lock(&self.shared.sessions).len()
    }

    /// Connected peers, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = lock(&self.shared.sessions).keys().cloned().collect();
        peers.sort();
        peers
    }
}

impl Drop for SessionHub {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.state).take() {
            running.shutdown.cancel();
        }
        for (_, handle) in lock(&self.shared.sessions).drain() {
            handle.close.cancel();
        }
    }
}

impl HubShared {
    fn emit(&self, event: HubEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn open_session(self: &Arc<Self>, id: PeerId, ws: ServerStream) {
        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        let replaced = lock(&self.sessions).insert(
            id.clone(),
            SessionHandle {
                serial,
                outbound,
                close: close.clone(),
            },
        );
        if let Some(old) = replaced {
            debug!(peer = %id, "replacing existing session");
            old.close.cancel();
        }
        info!(peer = %id, "session opened");

        tokio::spawn(write_loop(
            sink,
            outbound_rx,
            close.clone(),
            self.timings.ping_interval,
        ));
        tokio::spawn(read_loop(self.clone(), id, serial, stream, close));
    }

    /// Remove `id` only if it still maps to the session numbered `serial`.
    fn remove_if_current(&self, id: &PeerId, serial: u64) -> Option<SessionHandle> {
        let mut sessions = lock(&self.sessions);
        if sessions.get(id).is_some_and(|h| h.serial == serial) {
            sessions.remove(id)
        } else {
            None
        }
    }

    fn relay(&self, from: &PeerId, text: &str) {
        debug!(peer = %from, bytes = text.len(), "session message");
        for (id, handle) in lock(&self.sessions).iter() {
            if id != from {
                let _ = handle.outbound.send(Message::text(text.to_string()));
            }
        }
        self.emit(HubEvent::Message {
            from: from.clone(),
            text: text.to_string(),
        });
    }
}

async fn accept_loop(shared: Arc<HubShared>, listener: SessionListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok(incoming) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let remote = incoming.remote_address();
                        match incoming.upgrade().await {
                            Ok((id, ws)) => shared.open_session(id, ws),
                            Err(e) => debug!(remote = %remote, error = %e, "session upgrade failed"),
                        }
                    });
                }
                Err(e) => debug!(error = %e, "accept error"),
            },
        }
    }
    debug!("accept loop stopped");
}

async fn write_loop(
    mut sink: SplitSink<ServerStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    close: CancellationToken,
    ping_interval: std::time::Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        // The handle is cancelled before it is dropped, so a closed queue
        // never wins over the close signal.
        tokio::select! {
            biased;
            () = close.cancelled() => {
                let _ = sink.send(Message::Close(Some(normal_close("closed by server")))).await;
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = sink.send(Message::Close(Some(normal_close("closed by server")))).await;
                    break;
                };
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "session write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    debug!(error = %e, "session ping failed");
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    shared: Arc<HubShared>,
    id: PeerId,
    serial: u64,
    mut stream: SplitStream<ServerStream>,
    close: CancellationToken,
) {
    let idle_timeout = shared.timings.idle_timeout;
    let reason = loop {
        let next = tokio::select! {
            // Closed by the hub: whoever cancelled has already removed us.
            () = close.cancelled() => return,
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };
        match next {
            Err(_) => break "idle timeout".to_string(),
            Ok(None) => break "stream ended".to_string(),
            Ok(Some(Ok(Message::Text(text)))) => shared.relay(&id, text.as_str()),
            Ok(Some(Ok(Message::Close(frame)))) => {
                break frame.map_or_else(
                    || "closed by peer".to_string(),
                    |f| format!("closed by peer ({})", f.code),
                );
            }
            Ok(Some(Ok(other))) => trace!(peer = %id, kind = ?other, "non-text frame"),
            Ok(Some(Err(e))) => break e.to_string(),
        }
    };

    if let Some(handle) = shared.remove_if_current(&id, serial) {
        handle.close.cancel();
        drop(handle);
        info!(peer = %id, reason = %reason, "session ended");
        shared.emit(HubEvent::Disconnected(id));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
