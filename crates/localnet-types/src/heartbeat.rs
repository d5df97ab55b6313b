//! Discovery heartbeat broadcast by every node once per tick.

use serde::{Deserialize, Serialize};

/// A node's periodic announcement on the discovery port.
///
/// Field names on the wire are fixed (`senderIp`, `hostIp`,
/// `hasGameSession`, `lastSessionUpdate`) so nodes built from other
/// codebases can join the same election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Address of the node that sent this heartbeat.
    #[serde(rename = "senderIp")]
    pub sender_address: String,
    /// The host the sender currently believes in, if any.
    #[serde(rename = "hostIp", default)]
    pub claimed_host: Option<String>,
    /// Whether the sender has an active application session.
    #[serde(rename = "hasGameSession")]
    pub has_active_session: bool,
    /// Epoch milliseconds of the sender's last session activity.
    #[serde(rename = "lastSessionUpdate", default)]
    pub last_session_update: Option<i64>,
}

impl Heartbeat {
    /// Whether the sender claims the host role for itself.
    pub fn claims_host(&self) -> bool {
        self.claimed_host.as_deref() == Some(self.sender_address.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names() {
        let hb = Heartbeat {
            sender_address: "192.168.1.10".to_string(),
            claimed_host: Some("192.168.1.20".to_string()),
            has_active_session: true,
            last_session_update: Some(1_700_000_000_000),
        };
        let json = serde_json::to_value(&hb).unwrap();
        assert_eq!(json["senderIp"], "192.168.1.10");
        assert_eq!(json["hostIp"], "192.168.1.20");
        assert_eq!(json["hasGameSession"], true);
        assert_eq!(json["lastSessionUpdate"], 1_700_000_000_000_i64);
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let hb: Heartbeat =
            serde_json::from_str(r#"{"senderIp":"10.0.0.3","hasGameSession":false}"#).unwrap();
        assert_eq!(hb.claimed_host, None);
        assert_eq!(hb.last_session_update, None);
    }

    #[test]
    fn null_host_is_none() {
        let hb: Heartbeat = serde_json::from_str(
            r#"{"senderIp":"10.0.0.3","hostIp":null,"hasGameSession":false,"lastSessionUpdate":null}"#,
        )
        .unwrap();
        assert_eq!(hb.claimed_host, None);
        assert!(!hb.claims_host());
    }

    #[test]
    fn claims_host_only_for_self() {
        let mut hb = Heartbeat {
            sender_address: "10.0.0.3".to_string(),
            claimed_host: Some("10.0.0.9".to_string()),
            has_active_session: false,
            last_session_update: None,
        };
        assert!(!hb.claims_host());
        hb.claimed_host = Some("10.0.0.3".to_string());
        assert!(hb.claims_host());
    }
}
