//! Shared types for localnet.
//!
//! This crate contains the types shared across the localnet workspace:
//! peer identity, connectivity state, the discovery heartbeat, and the
//! application envelope exchanged over host sessions.

pub mod envelope;
pub mod heartbeat;
pub mod peer;

pub use envelope::{CustomEnvelope, Envelope, EnvelopeType};
pub use heartbeat::Heartbeat;
pub use peer::{ConnectivityState, PeerId};
