//! How a session ended, as seen from the reading side.

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Utf8Bytes};

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Normal or going-away close: the other side left on purpose.
    Expected,
    /// Anything else: abnormal close code, reset, I/O failure.
    Abnormal(String),
}

impl Termination {
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::Abnormal(_))
    }
}

/// A normal close, which the other side classifies as [`Termination::Expected`].
pub fn normal_close(reason: &str) -> CloseFrame {
    CloseFrame {
        code: CloseCode::Normal,
        reason: Utf8Bytes::from(reason.to_string()),
    }
}

/// Classify a received close frame.
///
/// A close without a frame carries no status code (1005) and counts as
/// abnormal, like every code other than normal (1000) and going away (1001).
pub fn classify_close_frame(frame: Option<&CloseFrame>) -> Termination {
    match frame.map(|f| f.code) {
        Some(CloseCode::Normal | CloseCode::Away) => Termination::Expected,
        Some(code) => Termination::Abnormal(format!("closed with code {code}")),
        None => Termination::Abnormal("closed without status".to_string()),
    }
}

/// Classify an error returned while reading from a session.
pub fn classify_read_error(err: &WsError) -> Termination {
    match err {
        // Only reported after a completed close handshake.
        WsError::ConnectionClosed | WsError::AlreadyClosed => Termination::Expected,
        other => Termination::Abnormal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;

    use super::*;

    fn frame(code: CloseCode) -> CloseFrame {
        CloseFrame {
            code,
            reason: "test".into(),
        }
    }

    #[test]
    fn normal_and_away_are_expected() {
        assert_eq!(
            classify_close_frame(Some(&frame(CloseCode::Normal))),
            Termination::Expected
        );
        assert_eq!(
            classify_close_frame(Some(&frame(CloseCode::Away))),
            Termination::Expected
        );
    }

    #[test]
    fn other_codes_are_abnormal() {
        for code in [CloseCode::Abnormal, CloseCode::Error, CloseCode::Protocol, CloseCode::Again] {
            assert!(classify_close_frame(Some(&frame(code))).is_abnormal());
        }
        assert!(classify_close_frame(None).is_abnormal());
    }

    #[test]
    fn our_close_is_expected_by_the_peer() {
        assert_eq!(
            classify_close_frame(Some(&normal_close("closed by server"))),
            Termination::Expected
        );
    }

    #[test]
    fn reset_is_abnormal() {
        let err = WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake);
        assert!(classify_read_error(&err).is_abnormal());
    }

    #[test]
    fn closed_is_expected() {
        assert_eq!(
            classify_read_error(&WsError::ConnectionClosed),
            Termination::Expected
        );
    }
}
