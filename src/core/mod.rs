//! # Core Protocol Components
//!
//! Low-level framing, codecs, and payload serialization.
//!
//! ## Components
//! - **Frame**: Binary frame format with a fixed 10-byte header
//! - **Codec**: Tokio codec and buffered reader for framing over byte streams
//! - **Serialization**: Primitive fast path plus pluggable serializers
//!
//! ## Wire Format
//! ```text
//! [Length(8, LE)] [PacketId(1)] [SenderId(1)] [Payload(N)]
//! ```
//!
//! ## Safety
//! - Maximum payload size is enforced before allocation (default 16MB)
//! - A clean close is reported separately from a truncated frame

pub mod codec;
pub mod frame;
pub mod serialization;
