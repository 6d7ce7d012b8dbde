//! # Payload Serialization
//!
//! Converts typed values to and from frame payloads.
//!
//! ## Resolution order
//! 1. **Primitive fast path**: `bool`, `char`, `String` and the fixed-width integer and
//!    float types map to their canonical little-endian bytes with no length prefix
//!    (the frame header already carries the length).
//! 2. **Registered serializer**: a [`PayloadSerializer`] stored in the
//!    [`SerializerRegistry`] under the value's type tag.
//! 3. **Tagged fallback**: any serde type, encoded with the configured
//!    [`SerializationFormat`] and wrapped in a header naming the format and the
//!    type tag, so the receiver can refuse a payload built for another type.
//!
//! ## Fallback layout
//! ```text
//! [FormatByte(1)] [TagLen(2, LE)] [Tag(TagLen)] [Body(N)]
//! ```
//!
//! ## Type tags
//! A type tag is the base name of the Rust type: module paths are stripped, so a
//! `shop::Order` sent by one build matches `orders::Order` in another build.
//!
//! ## Usage
//! ```rust
//! use peer_protocol::core::serialization::{SerializationConfig, SerializationFormat};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Position { x: i32, y: i32 }
//!
//! let config = SerializationConfig::new(SerializationFormat::Bincode);
//! let bytes = config.serialize(&Position { x: 1, y: 2 }).unwrap();
//! let back: Position = config.deserialize(&bytes).unwrap();
//! assert_eq!(back, Position { x: 1, y: 2 });
//!
//! // primitives carry no framing at all
//! assert_eq!(config.serialize(&7i64).unwrap(), 7i64.to_le_bytes());
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{constants, ProtocolError, Result};

/// Supported fallback serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Binary compact format (default, fastest)
    #[default]
    Bincode,
    /// Human-readable JSON format (debugging, interop)
    Json,
    /// Compact binary format (MessagePack, efficient)
    MessagePack,
}

impl SerializationFormat {
    /// Get the format identifier byte for wire protocol
    pub fn format_byte(self) -> u8 {
        match self {
            SerializationFormat::Bincode => 0x01,
            SerializationFormat::Json => 0x02,
            SerializationFormat::MessagePack => 0x03,
        }
    }

    /// Detect format from identifier byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SerializationFormat::Bincode),
            0x02 => Some(SerializationFormat::Json),
            0x03 => Some(SerializationFormat::MessagePack),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }

    /// Encode a value with this format, without any header
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Bincode => {
                bincode::serialize(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
            SerializationFormat::Json => {
                serde_json::to_vec(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
            SerializationFormat::MessagePack => {
                rmp_serde::to_vec(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
        }
    }

    /// Decode a value encoded with [`SerializationFormat::encode`]
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            SerializationFormat::Bincode => bincode::deserialize(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::Json => serde_json::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
        }
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable, build-independent name of `T`.
///
/// `alloc::vec::Vec<my_app::model::Item>` becomes `Vec<Item>`.
pub fn type_tag<T: ?Sized>() -> String {
    base_name(std::any::type_name::<T>())
}

fn base_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    let mut chars = full.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ':' if chars.peek() == Some(&':') => {
                chars.next();
                segment.clear();
            }
            c if c.is_alphanumeric() || c == '_' => segment.push(c),
            other => {
                out.push_str(&segment);
                segment.clear();
                out.push(other);
            }
        }
    }
    out.push_str(&segment);
    out
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        ProtocolError::MalformedPayload(format!(
            "{what} needs exactly {N} bytes, got {}",
            bytes.len()
        ))
    })
}

macro_rules! encode_le {
    ($any:expr; $($t:ty),*) => {
        $(
            if let Some(v) = $any.downcast_ref::<$t>() {
                return Some(v.to_le_bytes().to_vec());
            }
        )*
    };
}

macro_rules! decode_le {
    ($id:expr, $bytes:expr; $($t:ty),*) => {
        $(
            if $id == TypeId::of::<$t>() {
                let raw = fixed::<{ std::mem::size_of::<$t>() }>($bytes, stringify!($t));
                return Some(raw.map(|b| Box::new(<$t>::from_le_bytes(b)) as Box<dyn Any>));
            }
        )*
    };
}

/// Whether `T` takes the primitive fast path
pub fn is_primitive<T: 'static>() -> bool {
    let id = TypeId::of::<T>();
    [
        TypeId::of::<bool>(),
        TypeId::of::<char>(),
        TypeId::of::<String>(),
        TypeId::of::<u8>(),
        TypeId::of::<i8>(),
        TypeId::of::<i16>(),
        TypeId::of::<u16>(),
        TypeId::of::<i32>(),
        TypeId::of::<u32>(),
        TypeId::of::<i64>(),
        TypeId::of::<u64>(),
        TypeId::of::<i128>(),
        TypeId::of::<u128>(),
        TypeId::of::<f32>(),
        TypeId::of::<f64>(),
    ]
    .contains(&id)
}

/// Encode a primitive, or `None` if `T` is not a primitive
pub fn encode_primitive<T: 'static>(value: &T) -> Option<Vec<u8>> {
    let any = value as &dyn Any;
    encode_le!(any; u8, i8, i16, u16, i32, u32, i64, u64, i128, u128, f32, f64);

    if let Some(v) = any.downcast_ref::<bool>() {
        return Some(vec![u8::from(*v)]);
    }
    if let Some(v) = any.downcast_ref::<char>() {
        return Some(u32::from(*v).to_le_bytes().to_vec());
    }
    if let Some(v) = any.downcast_ref::<String>() {
        return Some(v.as_bytes().to_vec());
    }
    None
}

fn decode_primitive_any(id: TypeId, bytes: &[u8]) -> Option<Result<Box<dyn Any>>> {
    decode_le!(id, bytes; u8, i8, i16, u16, i32, u32, i64, u64, i128, u128, f32, f64);

    if id == TypeId::of::<bool>() {
        return Some(fixed::<1>(bytes, "bool").and_then(|[b]| match b {
            0 => Ok(Box::new(false) as Box<dyn Any>),
            1 => Ok(Box::new(true) as Box<dyn Any>),
            other => Err(ProtocolError::MalformedPayload(format!(
                "invalid bool byte {other}"
            ))),
        }));
    }
    if id == TypeId::of::<char>() {
        return Some(fixed::<4>(bytes, "char").and_then(|b| {
            let scalar = u32::from_le_bytes(b);
            char::from_u32(scalar)
                .map(|c| Box::new(c) as Box<dyn Any>)
                .ok_or_else(|| {
                    ProtocolError::MalformedPayload(format!("invalid char scalar {scalar:#x}"))
                })
        }));
    }
    if id == TypeId::of::<String>() {
        return Some(
            String::from_utf8(bytes.to_vec())
                .map(|s| Box::new(s) as Box<dyn Any>)
                .map_err(|e| ProtocolError::MalformedPayload(e.to_string())),
        );
    }
    None
}

/// Decode a primitive, or `None` if `T` is not a primitive
pub fn decode_primitive<T: 'static>(bytes: &[u8]) -> Option<Result<T>> {
    let decoded = decode_primitive_any(TypeId::of::<T>(), bytes)?;
    Some(decoded.and_then(|boxed| {
        boxed
            .downcast::<T>()
            .map(|v| *v)
            .map_err(|_| ProtocolError::Custom(format!("primitive downcast to {}", type_tag::<T>())))
    }))
}

/// Custom encoding for one type, registered in a [`SerializerRegistry`]
pub trait PayloadSerializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// Serializers keyed by type tag
#[derive(Clone, Default)]
pub struct SerializerRegistry {
    entries: Arc<RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `serializer` for `T`, replacing any earlier one
    pub fn register<T, S>(&self, serializer: S) -> Result<()>
    where
        T: 'static,
        S: PayloadSerializer<T> + 'static,
    {
        let entry: Arc<dyn PayloadSerializer<T>> = Arc::new(serializer);
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_SERIALIZER_LOCK.to_string()))?;
        entries.insert(type_tag::<T>(), Arc::new(entry));
        Ok(())
    }

    pub fn unregister<T: 'static>(&self) -> Result<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_SERIALIZER_LOCK.to_string()))?;
        Ok(entries.remove(&type_tag::<T>()).is_some())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(&type_tag::<T>()))
            .unwrap_or(false)
    }

    fn lookup<T: 'static>(&self) -> Result<Option<Arc<dyn PayloadSerializer<T>>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_SERIALIZER_LOCK.to_string()))?;
        Ok(entries
            .get(&type_tag::<T>())
            .and_then(|entry| entry.downcast_ref::<Arc<dyn PayloadSerializer<T>>>())
            .cloned())
    }
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<String> = self
            .entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("SerializerRegistry").field("tags", &tags).finish()
    }
}

/// Serialization settings shared by every connection of a process
#[derive(Debug, Clone, Default)]
pub struct SerializationConfig {
    pub format: SerializationFormat,
    pub serializers: SerializerRegistry,
}

impl SerializationConfig {
    pub fn new(format: SerializationFormat) -> Self {
        Self {
            format,
            serializers: SerializerRegistry::new(),
        }
    }

    /// Encode `value` into a frame payload
    pub fn serialize<T: Serialize + 'static>(&self, value: &T) -> Result<Vec<u8>> {
        if let Some(bytes) = encode_primitive(value) {
            return Ok(bytes);
        }
        if let Some(serializer) = self.serializers.lookup::<T>()? {
            return serializer.serialize(value);
        }

        let tag = type_tag::<T>();
        let tag_len = u16::try_from(tag.len())
            .map_err(|_| ProtocolError::SerializeError(format!("type tag too long: {tag}")))?;
        let body = self.format.encode(value)?;

        let mut out = Vec::with_capacity(3 + tag.len() + body.len());
        out.push(self.format.format_byte());
        out.extend_from_slice(&tag_len.to_le_bytes());
        out.extend_from_slice(tag.as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a frame payload produced by [`SerializationConfig::serialize`].
    ///
    /// On the fallback path any mismatch yields `DeserializationFailed`.
    pub fn deserialize<T: DeserializeOwned + 'static>(&self, bytes: &[u8]) -> Result<T> {
        if let Some(value) = decode_primitive::<T>(bytes) {
            return value;
        }
        if let Some(serializer) = self.serializers.lookup::<T>()? {
            return serializer.deserialize(bytes);
        }

        let expected = type_tag::<T>();
        let failed = |found: String| ProtocolError::DeserializationFailed {
            expected: expected.clone(),
            found,
        };

        if bytes.len() < 3 {
            return Err(failed(format!("{} byte payload", bytes.len())));
        }
        let format = SerializationFormat::from_byte(bytes[0])
            .ok_or_else(|| failed(format!("unknown format byte {:#04x}", bytes[0])))?;
        let tag_len = usize::from(u16::from_le_bytes([bytes[1], bytes[2]]));
        let tag_end = 3 + tag_len;
        if bytes.len() < tag_end {
            return Err(failed("truncated type tag".to_string()));
        }
        let tag = std::str::from_utf8(&bytes[3..tag_end])
            .map_err(|_| failed("non UTF-8 type tag".to_string()))?;
        if tag != expected {
            return Err(failed(tag.to_string()));
        }

        format
            .decode(&bytes[tag_end..])
            .map_err(|e| failed(format!("{tag} ({e})")))
    }
}

/// Encode `value` with `config`
pub fn serialize<T: Serialize + 'static>(value: &T, config: &SerializationConfig) -> Result<Vec<u8>> {
    config.serialize(value)
}

/// Decode a `T` from `bytes` with `config`
pub fn deserialize<T: DeserializeOwned + 'static>(
    bytes: &[u8],
    config: &SerializationConfig,
) -> Result<T> {
    config.deserialize(bytes)
}
