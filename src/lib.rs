//! # peer-protocol
//!
//! Binary peer-to-peer messaging over TCP: one server, many clients, each peer
//! identified by a one-byte client ID.
//!
//! ## Layers
//! - [`core`]: wire frames, the frame codec and payload serialization
//! - [`protocol`]: packet IDs and their registry, request/response correlation,
//!   rerouting rules, property synchronization and the handshake
//! - [`transport`]: the per-connection engine, the server hub and the client
//!   connector
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics
//!   and timeouts
//!
//! ## Quick start
//! ```rust,no_run
//! use peer_protocol::config::NetworkConfig;
//! use peer_protocol::transport::client::connect_with_defaults;
//! use tokio_stream::StreamExt;
//!
//! # async fn run() -> peer_protocol::error::Result<()> {
//! let config = NetworkConfig::from_env()?;
//! let (connection, mut events) = connect_with_defaults(&config).await?;
//! connection.send_string("ping")?;
//! while let Some(event) = events.next().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::core::frame::Frame;
pub use crate::core::serialization::{SerializationConfig, SerializationFormat};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::disconnect::DisconnectReason;
pub use crate::protocol::dispatcher::DataIds;
pub use crate::protocol::event::ConnectionEvent;
pub use crate::protocol::peer::PeerInfo;
pub use crate::transport::connection::{ConnectionContext, TcpConnection};
pub use crate::transport::server::{ServerEvent, ServerHandle, TcpServer};
