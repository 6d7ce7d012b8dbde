//! Peer identity exchanged during the bootstrap handshake.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::error::{ProtocolError, Result};

/// Client id before the server assigns one
pub const UNASSIGNED_ID: u8 = 255;

/// Fixed id of the server
pub const SERVER_ID: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    client_id: u8,
    pub name: String,
    pub address: Option<SocketAddr>,
    pub is_server: bool,
}

impl PeerInfo {
    /// Identity of a server; its id is always [`SERVER_ID`]
    pub fn server(name: impl Into<String>, address: Option<SocketAddr>) -> Self {
        Self {
            client_id: SERVER_ID,
            name: name.into(),
            address,
            is_server: true,
        }
    }

    /// Identity of a client that has not been assigned an id yet
    pub fn client(name: impl Into<String>, address: Option<SocketAddr>) -> Self {
        Self {
            client_id: UNASSIGNED_ID,
            name: name.into(),
            address,
            is_server: false,
        }
    }

    pub fn client_id(&self) -> u8 {
        self.client_id
    }

    pub fn is_assigned(&self) -> bool {
        self.client_id != UNASSIGNED_ID
    }

    /// Move from unassigned to `id`. Allowed exactly once.
    pub fn assign_id(&mut self, id: u8) -> Result<()> {
        if self.is_assigned() {
            return Err(ProtocolError::HandshakeError(format!(
                "client id already assigned ({})",
                self.client_id
            )));
        }
        if id == UNASSIGNED_ID || (id == SERVER_ID && !self.is_server) {
            return Err(ProtocolError::HandshakeError(format!(
                "cannot assign client id {id}"
            )));
        }
        self.client_id = id;
        Ok(())
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.client_id)
    }
}
