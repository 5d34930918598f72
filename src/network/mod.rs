// src/network/mod.rs
//! Network communication components
//!
//! Everything that talks to a mining pool:
//! - `messages`: Stratum v1 request/notification encoding
//! - `StratumClient`: one TCP session, job intake and share submission
//! - `PoolConnection`: watchdog and reconnection on top of the client

/// Stratum v1 wire messages
pub mod messages;

/// Mining pool client implementation
///
/// Handles the subscribe/authorize handshake, publishes jobs to the work
/// board and queues share submissions.
pub mod pool;

/// Connection supervision with linear backoff
pub mod connection;

// Re-export main components for cleaner imports
pub use connection::{ConnectionSettings, ConnectionState, PoolConnection, ReconnectPolicy};
pub use pool::{ClientStatus, Credentials, PoolEndpoint, ShareCounters, StratumClient};
