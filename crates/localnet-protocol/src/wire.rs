//! Session transport constants.
//!
//! Envelopes travel as WebSocket text frames, one envelope per frame. The
//! connecting peer names itself in the `id` query parameter of the
//! upgrade request: `ws://<host>:<port>/ws?id=<peer id>`.

use std::time::Duration;

use localnet_types::PeerId;

/// Default port the host's session hub listens on.
pub const DEFAULT_SESSION_PORT: u16 = 63287;

/// Request path of the session endpoint.
pub const SESSION_PATH: &str = "/ws";

/// Query parameter carrying the connecting peer's id.
pub const ID_PARAM: &str = "id";

/// Keep-alive ping period on both ends of a session.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// A session with no inbound traffic (including pongs) for this long is dropped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the URL a client connects to.
pub fn session_url(host: &str, port: u16, id: &PeerId) -> String {
    format!("ws://{host}:{port}{SESSION_PATH}?{ID_PARAM}={id}")
}

/// Extract the peer id from the query string of an upgrade request.
pub fn peer_id_from_query(query: Option<&str>) -> Option<PeerId> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == ID_PARAM)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
        .map(PeerId::new)
}
