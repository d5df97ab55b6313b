//! Peer identity and connectivity types.

use serde::{Deserialize, Serialize};

/// Identifier of a peer on the local network.
///
/// Derived from the peer's address by taking its last component, so
/// `192.168.1.42` becomes `42`. Every node derives the same id for a given
/// address without any coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an already-derived id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id from a dotted address.
    ///
    /// Addresses without a `.` are used whole.
    pub fn from_address(address: &str) -> Self {
        let last = address.rsplit('.').next().unwrap_or(address);
        Self(last.to_string())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Link state of the network interface the node discovers peers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectivityState {
    Connected,
    #[default]
    Disconnected,
}

impl ConnectivityState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_from_dotted_quad() {
        assert_eq!(PeerId::from_address("192.168.1.42").as_str(), "42");
        assert_eq!(PeerId::from_address("10.0.0.7").as_str(), "7");
    }

    #[test]
    fn peer_id_from_undotted_address() {
        assert_eq!(PeerId::from_address("localhost").as_str(), "localhost");
    }

    #[test]
    fn peer_id_display() {
        let id = PeerId::from_address("192.168.1.200");
        assert_eq!(id.to_string(), "200");
    }

    #[test]
    fn peer_id_serializes_as_plain_string() {
        let id = PeerId::new("12");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"12\"");
    }

    #[test]
    fn connectivity_default_is_disconnected() {
        assert!(!ConnectivityState::default().is_connected());
        assert!(ConnectivityState::Connected.is_connected());
    }
}
