//! # qimessaging-core
//!
//! Building blocks shared by every qimessaging layer:
//!
//! - **Buffer**: growable byte container with copy-on-write storage and
//!   sub-buffer attachments for large binary payloads
//! - **Data streams**: mirrored little-endian writer/reader over a buffer
//! - **Codec**: serde binary format used for every message payload
//! - **Url**: `tcp://` / `tcps://` endpoints
//! - **Records**: [`ServiceInfo`], capability maps
//! - **ProcessContext**: machine id, process id and object id counter

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod buffer;
mod codec;
mod context;
mod endpoint;
mod stream;
mod types;

// Buffer exports
pub use buffer::{
    BLOCK, Buffer, BufferError, BufferReader, INLINE_CAPACITY, SUB_BUFFER_PLACEHOLDER,
};

// Codec exports
pub use codec::{CodecError, Deserializer, Serializer, from_buffer, to_buffer, write_value};
pub use stream::{DataReader, DataWriter};

// Shared types
pub use context::{MAIN_OBJECT_ID, ProcessContext};
pub use types::{
    CapabilityMap, CapabilityValue, ServiceInfo, default_capabilities, is_internal_service,
};
pub use endpoint::{DEFAULT_PORT, Protocol, Url, UrlError};
