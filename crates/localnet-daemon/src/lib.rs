//! Node runtime for localnet.
//!
//! Ties discovery and election to the session channel: the [`Orchestrator`]
//! follows the elected host, runs the [`SessionHub`] when this node is the
//! host and keeps the [`SessionClient`] connected to whichever node is.

pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod orchestrator;
pub mod setup;
pub mod state;

pub use client::SessionClient;
pub use config::{Config, SessionTimings};
pub use error::DaemonError;
pub use hub::{HubEvent, SessionHub};
pub use orchestrator::{Identity, Orchestrator};
pub use state::{NodeStatus, Role};
