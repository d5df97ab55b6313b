//! Discovery subsystem errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket: {0}")]
    Bind(String),

    #[error("broadcast failed: {0}")]
    Send(String),

    #[error("local address not available")]
    NoLocalAddress,

    #[error("malformed heartbeat: {0}")]
    Decode(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
