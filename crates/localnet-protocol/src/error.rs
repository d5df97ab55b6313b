//! Protocol and transport errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection failed: {0}")]
    Connection(String),

    /// The host could not be reached at all. Worth retrying: the hub may
    /// still be starting.
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("serialisation error: {0}")]
    Serialization(String),

    #[error("deserialisation error: {0}")]
    Deserialization(String),

    #[error("unknown envelope type: {0}")]
    UnknownEnvelope(String),

    #[error("envelope registration rejected: {0}")]
    Registration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProtocolError {
    /// Whether a connect attempt that failed with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}
