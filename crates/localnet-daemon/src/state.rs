//! Node role and status snapshot.

use std::fmt;

/// What this node is doing in the current election outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// No host known yet, or offline.
    #[default]
    Idle,
    /// This node runs the session hub.
    Host,
    /// This node is connected (or connecting) to another node's hub.
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Host => write!(f, "Host"),
            Self::Client => write!(f, "Client"),
        }
    }
}

/// Point-in-time view of the node, published on a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub role: Role,
    /// The host this node is following, if any.
    pub host: Option<String>,
    /// Sessions on the local hub. Zero unless hosting.
    pub session_count: usize,
    pub wifi_connected: bool,
    /// Waiting for a (new) host connection.
    pub loading: bool,
}
