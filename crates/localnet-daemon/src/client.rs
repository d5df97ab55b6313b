//! Session client: one persistent connection to the current host.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use localnet_protocol::{
    classify_close_frame, classify_read_error, connect_session, normal_close, EnvelopeCodec,
    Termination,
};
use localnet_types::{Envelope, PeerId};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SessionTimings;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    id: PeerId,
}

struct Connection {
    target: Target,
    /// Ends the connection quietly.
    supersede: CancellationToken,
    /// Ends the connection as a host loss.
    abort: CancellationToken,
    task: JoinHandle<()>,
}

struct ClientShared {
    codec: Arc<EnvelopeCodec>,
    timings: SessionTimings,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    /// Held by the live connection for as long as it drains the queue.
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<Envelope>,
}

/// Connects to a host's hub and keeps the connection's queue flowing.
///
/// Envelopes sent while no connection is up are buffered and flushed when
/// the next connection starts its send loop.
pub struct SessionClient {
    shared: Arc<ClientShared>,
    current: Mutex<Option<Connection>>,
}

impl SessionClient {
    pub fn new(codec: Arc<EnvelopeCodec>, timings: SessionTimings) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(ClientShared {
                codec,
                timings,
                outbound_tx,
                outbound_rx: tokio::sync::Mutex::new(outbound_rx),
                connected,
                events,
            }),
            current: Mutex::new(None),
        }
    }

    /// Inbound envelopes, plus `ServerDownDetected` when the host is lost.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.shared.events.subscribe()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Connect to the hub at `host:port` as `id`.
    ///
    /// A no-op while a connection to the same target is still up or being
    /// attempted. A different target replaces the current connection
    /// without reporting a host loss.
    pub fn connect(&self, host: &str, port: u16, id: PeerId, is_host: bool) {
        let target = Target {
            host: host.to_string(),
            port,
            id,
        };
        let mut current = lock(&self.current);
        if let Some(conn) = current.as_ref() {
            if conn.target == target && !conn.task.is_finished() {
                debug!(host = %target.host, "already connected to host");
                return;
            }
        }
        if let Some(old) = current.take() {
            debug!(host = %old.target.host, "superseding connection");
            old.supersede.cancel();
        }

        info!(host = %target.host, port, peer = %target.id, "connecting to host");
        let supersede = CancellationToken::new();
        let abort = CancellationToken::new();
        let task = tokio::spawn(run_connection(
            self.shared.clone(),
            target.clone(),
            is_host,
            supersede.clone(),
            abort.clone(),
        ));
        *current = Some(Connection {
            target,
            supersede,
            abort,
            task,
        });
    }

    /// Queue an envelope for the host.
    pub fn send(&self, envelope: Envelope) {
        // The receiver lives in `shared`, so this cannot fail.
        let _ = self.shared.outbound_tx.send(envelope);
    }

    /// Tell the host that `id` is leaving.
    pub fn disconnect(&self, id: &PeerId) {
        self.send(Envelope::UserDisconnected { id: id.to_string() });
    }

    /// Drop the connection and report it as a host loss.
    pub fn abort(&self) {
        if let Some(conn) = lock(&self.current).take() {
            conn.abort.cancel();
        }
    }

    /// Close the connection normally.
    pub fn close(&self) {
        if let Some(conn) = lock(&self.current).take() {
            conn.supersede.cancel();
        }
    }

    /// The host of the current connection, if any.
    pub fn host(&self) -> Option<String> {
        lock(&self.current)
            .as_ref()
            .filter(|conn| !conn.task.is_finished())
            .map(|conn| conn.target.host.clone())
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        if let Some(conn) = lock(&self.current).take() {
            conn.supersede.cancel();
        }
    }
}

impl ClientShared {
    fn deliver(&self, text: &str) {
        match self.codec.decode(text) {
            Ok(envelope) => {
                trace!(tag = envelope.tag(), "envelope received");
                let _ = self.events.send(envelope);
            }
            Err(e) => debug!(error = %e, "dropping undecodable envelope"),
        }
    }
}

async fn run_connection(
    shared: Arc<ClientShared>,
    target: Target,
    is_host: bool,
    supersede: CancellationToken,
    abort: CancellationToken,
) {
    let ws = loop {
        let attempt = tokio::select! {
            () = supersede.cancelled() => return,
            () = abort.cancelled() => return,
            attempt = connect_session(&target.host, target.port, &target.id) => attempt,
        };
        match attempt {
            Ok(ws) => break ws,
            Err(e) if e.is_retryable() => {
                debug!(host = %target.host, error = %e, "host unreachable, retrying");
                tokio::select! {
                    () = supersede.cancelled() => return,
                    () = abort.cancelled() => return,
                    () = tokio::time::sleep(shared.timings.retry_delay) => {}
                }
            }
            Err(e) => {
                warn!(host = %target.host, error = %e, "connection to host failed");
                return;
            }
        }
    };

    let (mut sink, mut stream) = ws.split();
    let hello = Envelope::UserConnected {
        id: target.id.to_string(),
        is_host,
    };
    let handshake = match shared.codec.encode(&hello) {
        Ok(text) => sink.send(Message::text(text)).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    let termination = match handshake {
        Ok(()) => pump(&shared, &target, &mut sink, &mut stream, &supersede, &abort).await,
        Err(reason) => Some(Termination::Abnormal(reason)),
    };

    match termination {
        Some(Termination::Abnormal(reason)) => {
            warn!(host = %target.host, reason = %reason, "host lost");
            let _ = shared.events.send(Envelope::ServerDownDetected);
        }
        Some(Termination::Expected) => info!(host = %target.host, "host closed the session"),
        None => {
            let _ = sink.send(Message::Close(Some(normal_close("superseded")))).await;
            debug!(host = %target.host, "connection closed");
        }
    }
}

/// Drain the outbound queue and read inbound frames until the connection
/// ends. `None` means it was superseded.
///
/// The connected flag is only raised while the queue is held, so a
/// superseded connection can never clear it after its successor set it.
async fn pump<S, R>(
    shared: &ClientShared,
    target: &Target,
    sink: &mut S,
    stream: &mut R,
    supersede: &CancellationToken,
    abort: &CancellationToken,
) -> Option<Termination>
where
    S: futures::Sink<Message, Error = WsError> + Unpin,
    R: futures::Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut outbound = tokio::select! {
        () = supersede.cancelled() => return None,
        () = abort.cancelled() => return Some(Termination::Abnormal("aborted".to_string())),
        guard = shared.outbound_rx.lock() => guard,
    };
    shared.connected.send_replace(true);
    info!(host = %target.host, "connected to host");

    let ping_interval = shared.timings.ping_interval;
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            () = supersede.cancelled() => break None,
            () = abort.cancelled() => break Some(Termination::Abnormal("aborted".to_string())),
            Some(envelope) = outbound.recv() => {
                let text = match shared.codec.encode(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(tag = envelope.tag(), error = %e, "dropping unencodable envelope");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    break Some(Termination::Abnormal(e.to_string()));
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    break Some(Termination::Abnormal(e.to_string()));
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.deliver(text.as_str()),
                Some(Ok(Message::Close(frame))) => break Some(classify_close_frame(frame.as_ref())),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(classify_read_error(&e)),
                None => break Some(Termination::Abnormal("stream ended without close".to_string())),
            },
        }
    };
    shared.connected.send_replace(false);
    outcome
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
