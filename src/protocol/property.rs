//! # Property Synchronization
//!
//! One-directional replication of a named property to a bound instance on the
//! remote peer.
//!
//! Types opt in by implementing [`Bindable`], which exposes their properties by
//! name. A [`PropertyBinding`] ties one property of one shared instance to a sync
//! ID; inbound sync frames for that ID overwrite the property in place. A static
//! property is modelled by binding a process-wide shared instance.
//!
//! ## Wire layout
//! ```text
//! [SyncId(1)] [Value(N)]
//! ```
//!
//! ## Example
//! ```rust
//! use peer_protocol::core::serialization::SerializationConfig;
//! use peer_protocol::error::{ProtocolError, Result};
//! use peer_protocol::protocol::property::{Bindable, PropertyInfo};
//!
//! struct Lobby { title: String }
//!
//! impl Bindable for Lobby {
//!     fn describe(&self, name: &str) -> Option<PropertyInfo> {
//!         match name {
//!             "title" => Some(PropertyInfo::public::<String>()),
//!             _ => None,
//!         }
//!     }
//!
//!     fn set_by_name(&mut self, name: &str, payload: &[u8], config: &SerializationConfig) -> Result<()> {
//!         match name {
//!             "title" => self.title = config.deserialize(payload)?,
//!             _ => return Err(ProtocolError::PropertyNotFound(name.to_string())),
//!         }
//!         Ok(())
//!     }
//!
//!     fn get_by_name(&self, name: &str, config: &SerializationConfig) -> Result<Vec<u8>> {
//!         match name {
//!             "title" => config.serialize(&self.title),
//!             _ => Err(ProtocolError::PropertyNotFound(name.to_string())),
//!         }
//!     }
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::core::serialization::{type_tag, SerializationConfig};
use crate::error::{constants, ProtocolError, Result};

/// Shape of one property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub type_tag: String,
    pub public: bool,
}

impl PropertyInfo {
    pub fn public<T: ?Sized>() -> Self {
        Self {
            type_tag: type_tag::<T>(),
            public: true,
        }
    }

    pub fn private<T: ?Sized>() -> Self {
        Self {
            type_tag: type_tag::<T>(),
            public: false,
        }
    }
}

/// Access to a type's properties by name
pub trait Bindable: Send {
    /// `None` if the type has no property called `name`
    fn describe(&self, name: &str) -> Option<PropertyInfo>;

    /// Decode `payload` into the property's declared type and assign it
    fn set_by_name(&mut self, name: &str, payload: &[u8], config: &SerializationConfig)
        -> Result<()>;

    /// Serialize the property's current value
    fn get_by_name(&self, name: &str, config: &SerializationConfig) -> Result<Vec<u8>>;
}

pub type SharedBindable = Arc<Mutex<dyn Bindable>>;

/// A property of a shared instance bound to a sync ID
#[derive(Clone)]
pub struct PropertyBinding {
    pub packet_id: u8,
    pub property: String,
    pub type_tag: String,
    target: SharedBindable,
}

impl PropertyBinding {
    /// Resolve `property` on `target`.
    ///
    /// Fails with `PropertyNotFound` or `PropertyNotPublic`.
    pub fn new(target: SharedBindable, property: &str, packet_id: u8) -> Result<Self> {
        let info = {
            let instance = target
                .lock()
                .map_err(|_| ProtocolError::Custom(constants::ERR_PROPERTY_LOCK.to_string()))?;
            instance
                .describe(property)
                .ok_or_else(|| ProtocolError::PropertyNotFound(property.to_string()))?
        };
        if !info.public {
            return Err(ProtocolError::PropertyNotPublic(property.to_string()));
        }
        Ok(Self {
            packet_id,
            property: property.to_string(),
            type_tag: info.type_tag,
            target,
        })
    }

    /// Write an inbound value into the bound instance
    pub fn apply(&self, payload: &[u8], config: &SerializationConfig) -> Result<()> {
        let mut instance = self
            .target
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_PROPERTY_LOCK.to_string()))?;
        instance.set_by_name(&self.property, payload, config)
    }

    /// Serialized current value of the bound property
    pub fn current_value(&self, config: &SerializationConfig) -> Result<Vec<u8>> {
        let instance = self
            .target
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_PROPERTY_LOCK.to_string()))?;
        instance.get_by_name(&self.property, config)
    }
}

impl fmt::Debug for PropertyBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyBinding")
            .field("packet_id", &self.packet_id)
            .field("property", &self.property)
            .field("type_tag", &self.type_tag)
            .finish_non_exhaustive()
    }
}
