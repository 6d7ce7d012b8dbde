//! # Packet ID Registry
//!
//! [`DataIds`] maps packet IDs to meaning and turns inbound frames into a
//! [`Resolution`] the connection acts on.
//!
//! Resolution order for every frame:
//! 1. the shared reroute table; a matching rule short-circuits local handling
//! 2. the reserved IDs (string, int64, request, response, property sync,
//!    peer info, disconnect)
//! 3. registered custom packets (IDs 2..=240)
//!
//! Anything else, including the server-stop ID, fails with `UndefinedPacket`.
//! A decode failure on a known ID is also an error; the connection reports both
//! as an undefined packet with the raw bytes attached.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

use crate::core::frame::Frame;
use crate::core::serialization::{type_tag, SerializationConfig};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::disconnect::DisconnectNotice;
use crate::protocol::ids;
use crate::protocol::peer::PeerInfo;
use crate::protocol::property::{PropertyBinding, SharedBindable};
use crate::protocol::request::SharedResponseProviders;
use crate::protocol::reroute::{RerouteRule, SharedRerouteTable};

type CustomHandler = dyn Fn(&[u8], u8, &SerializationConfig) -> Result<()> + Send + Sync + 'static;

struct CustomPacket {
    type_tag: String,
    handler: Arc<CustomHandler>,
}

/// What an inbound frame turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Forward unchanged according to the rule
    Rerouted(RerouteRule),
    Text(String),
    Int64(i64),
    /// `response` is `None` when no provider answers `request_id`
    Request {
        request_id: u8,
        response: Option<Vec<u8>>,
    },
    /// `payload` excludes the request ID prefix
    Response { request_id: u8, payload: Bytes },
    /// The bound property has already been written
    PropertySynced { property: String, packet_id: u8 },
    PeerInfo(PeerInfo),
    Disconnect(DisconnectNotice),
    /// The registered callback has already run
    Custom { packet_id: u8, type_tag: String },
}

/// Packet ID registry of one connection
pub struct DataIds {
    local_id: u8,
    serialization: SerializationConfig,
    reroutes: SharedRerouteTable,
    providers: SharedResponseProviders,
    custom: Arc<RwLock<HashMap<u8, CustomPacket>>>,
    responses: Arc<RwLock<HashMap<u8, String>>>,
    properties: Arc<RwLock<HashMap<u8, PropertyBinding>>>,
}

impl DataIds {
    pub fn new(
        local_id: u8,
        serialization: SerializationConfig,
        reroutes: SharedRerouteTable,
        providers: SharedResponseProviders,
    ) -> Self {
        Self {
            local_id,
            serialization,
            reroutes,
            providers,
            custom: Arc::new(RwLock::new(HashMap::new())),
            responses: Arc::new(RwLock::new(HashMap::new())),
            properties: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn local_id(&self) -> u8 {
        self.local_id
    }

    pub fn serialization(&self) -> &SerializationConfig {
        &self.serialization
    }

    pub fn reroutes(&self) -> &SharedRerouteTable {
        &self.reroutes
    }

    pub fn providers(&self) -> &SharedResponseProviders {
        &self.providers
    }

    fn insert_custom(&self, packet_id: u8, entry: CustomPacket) -> Result<()> {
        if ids::is_reserved(packet_id) {
            return Err(ProtocolError::PacketIdReserved(packet_id));
        }
        let mut custom = self
            .custom
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;
        if let Some(existing) = custom.get(&packet_id) {
            return Err(ProtocolError::PacketIdInUse {
                id: packet_id,
                existing: existing.type_tag.clone(),
            });
        }
        debug!(packet_id, type_tag = %entry.type_tag, "Custom packet registered");
        custom.insert(packet_id, entry);
        Ok(())
    }

    /// Register `T` under `packet_id`; `callback` receives each decoded value and
    /// the sender's client ID.
    pub fn register_custom_packet<T, F>(&self, packet_id: u8, callback: F) -> Result<()>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T, u8) + Send + Sync + 'static,
    {
        let handler = move |payload: &[u8], sender_id: u8, config: &SerializationConfig| {
            callback(config.deserialize::<T>(payload)?, sender_id);
            Ok(())
        };
        self.insert_custom(
            packet_id,
            CustomPacket {
                type_tag: type_tag::<T>(),
                handler: Arc::new(handler),
            },
        )
    }

    /// Register `T` under `packet_id` without a callback.
    ///
    /// Enough for the sending side. Inbound frames are still checked against
    /// `T` and surfaced as events carrying the encoded payload.
    pub fn declare_custom_packet<T>(&self, packet_id: u8) -> Result<()>
    where
        T: DeserializeOwned + 'static,
    {
        let check = |payload: &[u8], _: u8, config: &SerializationConfig| {
            config.deserialize::<T>(payload).map(|_| ())
        };
        self.insert_custom(
            packet_id,
            CustomPacket {
                type_tag: type_tag::<T>(),
                handler: Arc::new(check),
            },
        )
    }

    pub fn unregister_custom_packet(&self, packet_id: u8) -> Result<bool> {
        let mut custom = self
            .custom
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;
        Ok(custom.remove(&packet_id).is_some())
    }

    pub fn custom_type_tag(&self, packet_id: u8) -> Option<String> {
        self.custom
            .read()
            .ok()
            .and_then(|custom| custom.get(&packet_id).map(|entry| entry.type_tag.clone()))
    }

    /// Check that `T` may be sent under `packet_id`
    pub fn check_custom<T: ?Sized>(&self, packet_id: u8) -> Result<()> {
        let registered = self
            .custom_type_tag(packet_id)
            .ok_or(ProtocolError::UndefinedPacket(packet_id))?;
        let requested = type_tag::<T>();
        if registered != requested {
            return Err(ProtocolError::PacketTypeMismatch {
                id: packet_id,
                registered,
                requested,
            });
        }
        Ok(())
    }

    /// Declare that requests for `request_id` are answered with a `T`.
    ///
    /// Declaring the same type twice is a no-op.
    pub fn declare_response<T: DeserializeOwned + 'static>(&self, request_id: u8) -> Result<()> {
        let requested = type_tag::<T>();
        let mut responses = self
            .responses
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;
        match responses.get(&request_id) {
            Some(declared) if *declared != requested => Err(ProtocolError::RequestTypeMismatch {
                id: request_id,
                declared: declared.clone(),
                requested,
            }),
            Some(_) => Ok(()),
            None => {
                responses.insert(request_id, requested);
                Ok(())
            }
        }
    }

    pub fn response_type(&self, request_id: u8) -> Option<String> {
        self.responses
            .read()
            .ok()
            .and_then(|responses| responses.get(&request_id).cloned())
    }

    /// Check that a request for `request_id` may expect a `T`
    pub fn check_response<T: ?Sized>(&self, request_id: u8) -> Result<()> {
        let declared = self
            .response_type(request_id)
            .ok_or(ProtocolError::RequestNotDeclared(request_id))?;
        let requested = type_tag::<T>();
        if declared != requested {
            return Err(ProtocolError::RequestTypeMismatch {
                id: request_id,
                declared,
                requested,
            });
        }
        Ok(())
    }

    /// Bind `property` of `target` to the sync ID `packet_id`
    pub fn bind_property(&self, target: SharedBindable, property: &str, packet_id: u8) -> Result<()> {
        let binding = PropertyBinding::new(target, property, packet_id)?;
        let mut properties = self
            .properties
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;
        if properties.contains_key(&packet_id) {
            return Err(ProtocolError::PropertyIdInUse(packet_id));
        }
        debug!(packet_id, property, "Property bound");
        properties.insert(packet_id, binding);
        Ok(())
    }

    pub fn unbind_property(&self, packet_id: u8) -> Result<bool> {
        let mut properties = self
            .properties
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;
        Ok(properties.remove(&packet_id).is_some())
    }

    pub fn binding(&self, packet_id: u8) -> Option<PropertyBinding> {
        self.properties
            .read()
            .ok()
            .and_then(|properties| properties.get(&packet_id).cloned())
    }

    /// Interpret an inbound frame.
    ///
    /// Side effects (custom callbacks, property writes, provider calls) happen
    /// here; sending replies and emitting events is left to the caller.
    pub fn resolve(&self, frame: &Frame) -> Result<Resolution> {
        if let Some(rule) = self
            .reroutes
            .evaluate(frame.packet_id, frame.sender_id, self.local_id)?
        {
            trace!(packet_id = frame.packet_id, to = rule.to_client, "Frame matches reroute rule");
            return Ok(Resolution::Rerouted(rule));
        }

        let payload = frame.payload.as_ref();
        match frame.packet_id {
            ids::STRING => Ok(Resolution::Text(self.serialization.deserialize(payload)?)),
            ids::INT64 => Ok(Resolution::Int64(self.serialization.deserialize(payload)?)),
            ids::REQUEST => {
                let request_id = match payload {
                    [id] => *id,
                    _ => {
                        return Err(ProtocolError::MalformedPayload(format!(
                            "request carries {} bytes, expected 1",
                            payload.len()
                        )))
                    }
                };
                match self.providers.handle_request(request_id, &self.serialization) {
                    Ok(bytes) => Ok(Resolution::Request {
                        request_id,
                        response: Some(bytes),
                    }),
                    Err(ProtocolError::NotImplemented(_)) => Ok(Resolution::Request {
                        request_id,
                        response: None,
                    }),
                    Err(e) => Err(e),
                }
            }
            ids::RESPONSE => {
                let request_id = sub_id(payload, "response")?;
                Ok(Resolution::Response {
                    request_id,
                    payload: frame.payload.slice(1..),
                })
            }
            ids::PROPERTY_SYNC => {
                let sync_id = sub_id(payload, "property sync")?;
                let binding = self
                    .binding(sync_id)
                    .ok_or(ProtocolError::PropertyNotBound(sync_id))?;
                binding.apply(&payload[1..], &self.serialization)?;
                Ok(Resolution::PropertySynced {
                    property: binding.property,
                    packet_id: sync_id,
                })
            }
            ids::PEER_INFO => bincode::deserialize(payload)
                .map(Resolution::PeerInfo)
                .map_err(|e| ProtocolError::MalformedPayload(format!("peer info: {e}"))),
            ids::DISCONNECT => Ok(Resolution::Disconnect(DisconnectNotice::from_payload(
                payload,
            )?)),
            packet_id @ ids::FIRST_CUSTOM..=ids::LAST_CUSTOM => {
                let (type_tag, handler) = {
                    let custom = self.custom.read().map_err(|_| {
                        ProtocolError::Custom(constants::ERR_REGISTRY_READ_LOCK.to_string())
                    })?;
                    let entry = custom
                        .get(&packet_id)
                        .ok_or(ProtocolError::UndefinedPacket(packet_id))?;
                    (entry.type_tag.clone(), entry.handler.clone())
                };
                handler(payload, frame.sender_id, &self.serialization)?;
                Ok(Resolution::Custom {
                    packet_id,
                    type_tag,
                })
            }
            other => Err(ProtocolError::UndefinedPacket(other)),
        }
    }
}

fn sub_id(payload: &[u8], what: &str) -> Result<u8> {
    payload
        .first()
        .copied()
        .ok_or_else(|| ProtocolError::MalformedPayload(format!("empty {what} payload")))
}

impl std::fmt::Debug for DataIds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let custom: Vec<u8> = self
            .custom
            .read()
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default();
        f.debug_struct("DataIds")
            .field("local_id", &self.local_id)
            .field("custom", &custom)
            .finish_non_exhaustive()
    }
}
