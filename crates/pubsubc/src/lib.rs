//! Channel points pub/sub client: OAuth bootstrap plus a persistent
//! LISTEN session with heartbeat and two-phase shutdown.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI parsing and layered configuration.
pub mod config;
/// WebSocket session: dial, LISTEN, reader/writer loops and close rendezvous.
pub mod connection;
/// Error taxonomy for the client.
pub mod error;
/// Consumers of unwrapped pub/sub events.
pub mod events;
/// Token acquisition: direct token or local OAuth callback listener.
pub mod oauth;
/// Process lifetime: token → session → shutdown.
pub mod orchestrator;

pub use error::ClientError;
