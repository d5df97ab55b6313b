//! WebSocket session transport and envelope codec for localnet.
//!
//! This crate handles the host-to-peer session channel: WebSocket accept
//! and connect (via tokio-tungstenite), classification of how a session
//! ended, and the JSON envelope codec with its runtime type registry.

pub mod codec;
pub mod connection;
pub mod error;
pub mod transport;
pub mod wire;

pub use codec::{EnvelopeCodec, EnvelopeRegistration};
pub use connection::{classify_close_frame, classify_read_error, normal_close, Termination};
pub use error::ProtocolError;
pub use transport::{connect_session, ClientStream, IncomingSession, ServerStream, SessionListener};
