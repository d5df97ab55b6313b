//! Heartbeat wire format: one JSON object per UTF-8 datagram.

use localnet_types::Heartbeat;

use crate::error::DiscoveryError;

/// Default port heartbeats are broadcast on.
pub const DEFAULT_DISCOVERY_PORT: u16 = 60000;

/// Receive buffer size. Heartbeats are well under this.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

pub fn encode_heartbeat(heartbeat: &Heartbeat) -> Result<Vec<u8>, DiscoveryError> {
    serde_json::to_vec(heartbeat).map_err(|e| DiscoveryError::Other(e.into()))
}

pub fn decode_heartbeat(payload: &[u8]) -> Result<Heartbeat, DiscoveryError> {
    serde_json::from_slice(payload).map_err(|e| DiscoveryError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_heartbeat_fits_a_datagram() {
        let hb = Heartbeat {
            sender_address: "255.255.255.255".to_string(),
            claimed_host: Some("255.255.255.255".to_string()),
            has_active_session: true,
            last_session_update: Some(i64::MAX),
        };
        let bytes = encode_heartbeat(&hb).unwrap();
        assert!(bytes.len() < MAX_DATAGRAM_SIZE);
        assert_eq!(decode_heartbeat(&bytes).unwrap(), hb);
    }

    #[test]
    fn accepts_foreign_encoding() {
        let hb = decode_heartbeat(
            br#"{"senderIp":"192.168.0.5","hostIp":"192.168.0.9","hasGameSession":true,"lastSessionUpdate":1000,"v":2}"#,
        )
        .unwrap();
        assert_eq!(hb.sender_address, "192.168.0.5");
        assert_eq!(hb.claimed_host.as_deref(), Some("192.168.0.9"));
        assert_eq!(hb.last_session_update, Some(1000));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode_heartbeat(b"hello"),
            Err(DiscoveryError::Decode(_))
        ));
        assert!(matches!(
            decode_heartbeat(br#"{"hostIp":"1.2.3.4"}"#),
            Err(DiscoveryError::Decode(_))
        ));
    }
}
