//! # Error Types
//!
//! Error handling for the peer messaging protocol.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`ProtocolError`]. Variants are grouped by the layer that raises them.
//!
//! ## Error Categories
//! - **Registration Errors**: packet ID collisions, unknown or non-public properties,
//!   duplicate reroute rules. Raised synchronously by the call that caused them.
//! - **Protocol Errors**: undefined packet IDs, oversized or malformed frames
//! - **Transport Errors**: I/O failures, closed connections, timeouts
//! - **Serialization Errors**: payloads that cannot be reconstructed into the requested type
//! - **RPC Errors**: requests for undeclared IDs, missing providers, cancelled waits
//!
//! ## Example Usage
//! ```rust
//! use peer_protocol::error::{ProtocolError, Result};
//! use peer_protocol::protocol::ids;
//!
//! fn check(id: u8) -> Result<()> {
//!     if ids::is_reserved(id) {
//!         return Err(ProtocolError::PacketIdReserved(id));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check(0).is_err());
//! assert!(check(7).is_ok());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock-related error messages
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on packet registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on packet registry";
    pub const ERR_REROUTE_LOCK: &str = "Failed to acquire lock on reroute table";
    pub const ERR_PROVIDER_LOCK: &str = "Failed to acquire lock on response providers";
    pub const ERR_PENDING_LOCK: &str = "Failed to acquire lock on pending requests";
    pub const ERR_PROPERTY_LOCK: &str = "Failed to acquire lock on bound instance";
    pub const ERR_PEER_TABLE_LOCK: &str = "Failed to acquire lock on peer table";
    pub const ERR_SERIALIZER_LOCK: &str = "Failed to acquire lock on serializer registry";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_SEND_QUEUE_CLOSED: &str = "Send queue closed";
    pub const ERR_NO_FORWARDER: &str = "No forwarder installed for rerouted frame";

    /// Handshake errors
    pub const ERR_HANDSHAKE_UNEXPECTED: &str = "Expected a peer-info frame during handshake";
    pub const ERR_HANDSHAKE_CLOSED: &str = "Peer closed the stream during handshake";
    pub const ERR_HANDSHAKE_ID: &str = "Peer announced an unassigned client id";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Deserialization failed: expected {expected}, found {found}")]
    DeserializationFailed { expected: String, found: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Undefined packet id {0}")]
    UndefinedPacket(u8),

    #[error("Packet id {0} is reserved")]
    PacketIdReserved(u8),

    #[error("Packet id {id} is already registered for {existing}")]
    PacketIdInUse { id: u8, existing: String },

    #[error("Packet id {id} carries {registered}, not {requested}")]
    PacketTypeMismatch {
        id: u8,
        registered: String,
        requested: String,
    },

    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    #[error("Property is not public: {0}")]
    PropertyNotPublic(String),

    #[error("Property sync id {0} is already bound")]
    PropertyIdInUse(u8),

    #[error("Property sync id {0} is not bound")]
    PropertyNotBound(u8),

    #[error("Reroute rule for packet {packet_id} from client {from_client} already exists")]
    DuplicateReroute { packet_id: u8, from_client: u8 },

    #[error("Invalid reroute rule: {0}")]
    InvalidReroute(String),

    #[error("Response provider for request id {0} already registered")]
    ProviderIdInUse(u8),

    #[error("Request id {0} was not declared")]
    RequestNotDeclared(u8),

    #[error("Request id {id} was declared for {declared}, not {requested}")]
    RequestTypeMismatch {
        id: u8,
        declared: String,
        requested: String,
    },

    #[error("Request id {0} is not implemented")]
    NotImplemented(u8),

    #[error("Request id {0} was cancelled before a response arrived")]
    RequestCancelled(u8),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error belongs to the registration class (caller mistakes)
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::PacketIdReserved(_)
                | ProtocolError::PacketIdInUse { .. }
                | ProtocolError::PropertyNotFound(_)
                | ProtocolError::PropertyNotPublic(_)
                | ProtocolError::PropertyIdInUse(_)
                | ProtocolError::DuplicateReroute { .. }
                | ProtocolError::InvalidReroute(_)
                | ProtocolError::ProviderIdInUse(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
