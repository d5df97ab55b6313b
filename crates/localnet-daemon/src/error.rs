//! Daemon errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    /// Retries to resolve the local address ran out.
    #[error("local address not found")]
    LocalAddressNotFound,

    #[error("no host has been elected")]
    NoHost,

    #[error("protocol error: {0}")]
    Protocol(#[from] localnet_protocol::ProtocolError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
