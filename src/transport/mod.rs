//! # Transport Layer
//!
//! TCP plumbing: the per-connection engine, the server hub and the client
//! connector.

pub mod client;
pub mod connection;
pub mod server;

pub use connection::{ConnectionContext, ConnectionState, EventStream, TcpConnection};
