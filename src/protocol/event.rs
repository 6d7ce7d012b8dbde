//! Events a connection reports to the application.

use bytes::Bytes;

use crate::protocol::disconnect::DisconnectReason;
use crate::protocol::peer::PeerInfo;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StringReceived {
        value: String,
        sender_id: u8,
    },
    Int64Received {
        value: i64,
        sender_id: u8,
    },
    /// No registration for the ID, or a payload that could not be interpreted.
    /// The raw bytes are kept so the application can still inspect the frame.
    UndefinedPacket {
        packet_id: u8,
        sender_id: u8,
        payload: Bytes,
    },
    /// A registered custom packet was decoded and its callback, if any, has
    /// run. `payload` is the encoded value, readable with the registry's
    /// [`SerializationConfig`](crate::core::serialization::SerializationConfig).
    CustomPacket {
        packet_id: u8,
        sender_id: u8,
        type_tag: String,
        payload: Bytes,
    },
    PropertySynchronized {
        property: String,
        packet_id: u8,
    },
    /// A frame was handed to another peer instead of being handled here
    Rerouted {
        origin: u8,
        destination: u8,
        packet_id: u8,
        payload: Bytes,
        user_defined: bool,
    },
    ResponseReceived {
        request_id: u8,
    },
    /// The remote side asked for a request ID with no provider here
    RequestUnhandled {
        request_id: u8,
        sender_id: u8,
    },
    PeerInfoUpdated(PeerInfo),
    Disconnected {
        client_id: u8,
        reason: DisconnectReason,
    },
}

impl ConnectionEvent {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ConnectionEvent::Disconnected { .. })
    }
}
