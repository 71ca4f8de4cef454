//! Message envelope: header fields plus a payload [`Buffer`].

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;

use qimessaging_core::{Buffer, CodecError, from_buffer, to_buffer};

use crate::wire::{MAGIC, MessageHeader, PROTOCOL_VERSION, WireError};

/// Well-known service ids.
pub mod service {
    /// Control service answered by the server itself.
    pub const SERVER: u32 = 0;
    /// The service directory.
    pub const SERVICE_DIRECTORY: u32 = 1;
}

/// Well-known object ids.
pub mod object {
    /// Invalid object, messages addressed to it are dropped.
    pub const NONE: u32 = 0;
    /// Main object of a service.
    pub const MAIN: u32 = 1;
}

/// Action ids with a fixed meaning.
pub mod action {
    /// Subscribe to a signal of a bound object.
    pub const REGISTER_EVENT: u32 = 0;
    /// Unsubscribe from a signal.
    pub const UNREGISTER_EVENT: u32 = 1;
    /// Fetch the method/signal table.
    pub const META_OBJECT: u32 = 2;
    /// Release an object minted for the caller.
    pub const TERMINATE: u32 = 3;
    /// Read a property.
    pub const GET_PROPERTY: u32 = 5;
    /// Write a property.
    pub const SET_PROPERTY: u32 = 6;
    /// List properties.
    pub const PROPERTIES: u32 = 7;
    /// Subscribe to a signal, with its signature.
    pub const REGISTER_EVENT_WITH_SIGNATURE: u32 = 8;

    /// Server control: connection handshake.
    pub const SERVER_CONNECT: u32 = 4;
    /// Server control: authentication and capability exchange.
    pub const SERVER_AUTHENTICATE: u32 = 8;

    /// First action id available to user methods.
    pub const FIRST_USER_ACTION: u32 = 100;
}

/// Flag bits of the header.
pub mod flags {
    /// The payload carries its own type description.
    pub const DYNAMIC_PAYLOAD: u8 = 0x1;
    /// The call requests a specific return type.
    pub const RETURN_TYPE: u8 = 0x2;
}

/// Kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Invalid sentinel.
    None = 0,
    /// Method call expecting a reply.
    Call = 1,
    /// Successful answer to a call.
    Reply = 2,
    /// Failed answer to a call.
    Error = 3,
    /// Method call without reply.
    Post = 4,
    /// Signal emission.
    Event = 5,
    /// Capability map exchange.
    Capability = 6,
    /// Request to cancel a call.
    Cancel = 7,
    /// Answer to a canceled call.
    Canceled = 8,
}

impl MessageType {
    /// Decode a type code; unknown codes map to [`MessageType::None`].
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => MessageType::Call,
            2 => MessageType::Reply,
            3 => MessageType::Error,
            4 => MessageType::Post,
            5 => MessageType::Event,
            6 => MessageType::Capability,
            7 => MessageType::Cancel,
            8 => MessageType::Canceled,
            _ => MessageType::None,
        }
    }

    /// Type code written on the wire.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

/// Fresh id, unique within this process until the counter wraps.
pub fn next_message_id() -> u32 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identifies a request/response pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageAddress {
    /// Message id.
    pub message_id: u32,
    /// Service id.
    pub service: u32,
    /// Object id.
    pub object: u32,
    /// Action id.
    pub action: u32,
}

impl MessageAddress {
    /// Build an address.
    pub fn new(message_id: u32, service: u32, object: u32, action: u32) -> Self {
        Self {
            message_id,
            service,
            object,
            action,
        }
    }
}

impl fmt::Display for MessageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}, {}.{}.{}}}",
            self.message_id, self.service, self.object, self.action
        )
    }
}

/// A protocol message.
///
/// Cloning is cheap: the payload buffer is shared until one of the copies
/// mutates it.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    header: MessageHeader,
    buffer: Buffer,
}

impl Message {
    /// Create a message with a fresh id.
    ///
    /// The `message_id` of `address` is ignored.
    pub fn new(message_type: MessageType, address: MessageAddress) -> Self {
        Self::with_id(
            next_message_id(),
            message_type,
            MessageAddress {
                message_id: 0,
                ..address
            },
        )
    }

    /// Create a message with an explicit id.
    pub fn with_id(id: u32, message_type: MessageType, address: MessageAddress) -> Self {
        Self {
            header: MessageHeader {
                magic: MAGIC,
                id,
                size: 0,
                version: PROTOCOL_VERSION,
                message_type: message_type.code(),
                flags: 0,
                service: address.service,
                object: address.object,
                action: address.action,
            },
            buffer: Buffer::new(),
        }
    }

    /// Rebuild a message read from the network.
    pub fn from_parts(header: MessageHeader, buffer: Buffer) -> Self {
        Self { header, buffer }
    }

    /// Reply to `call`: same id and destination, empty payload.
    pub fn build_reply(call: &Message) -> Self {
        Self::with_id(call.id(), MessageType::Reply, call.address())
    }

    /// Error answer to `call` carrying `description`.
    pub fn build_error(call: &Message, description: &str) -> Self {
        let mut error = Self::with_id(call.id(), MessageType::Error, call.address());
        error.set_error(description);
        error
    }

    /// Copy of `message` re-addressed to `service`/`object` under a fresh id.
    ///
    /// Used when relaying a message to another endpoint.
    pub fn build_forward(message: &Message, service: u32, object: u32) -> Self {
        let mut forward = message.clone();
        forward.header.id = next_message_id();
        forward.header.service = service;
        forward.header.object = object;
        forward
    }

    /// Message id.
    pub fn id(&self) -> u32 {
        self.header.id
    }

    /// Destination service.
    pub fn service(&self) -> u32 {
        self.header.service
    }

    /// Destination object.
    pub fn object(&self) -> u32 {
        self.header.object
    }

    /// Method, signal or event id.
    pub fn action(&self) -> u32 {
        self.header.action
    }

    /// Message type, [`MessageType::None`] for unknown codes.
    pub fn message_type(&self) -> MessageType {
        MessageType::from_code(self.header.message_type)
    }

    /// Flag bits.
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    /// Protocol version.
    pub fn version(&self) -> u16 {
        self.header.version
    }

    /// Full address of the message.
    pub fn address(&self) -> MessageAddress {
        MessageAddress::new(self.id(), self.service(), self.object(), self.action())
    }

    /// Override the id.
    pub fn set_id(&mut self, id: u32) {
        self.header.id = id;
    }

    /// Change the message type.
    pub fn set_type(&mut self, message_type: MessageType) {
        self.header.message_type = message_type.code();
    }

    /// Change the destination service.
    pub fn set_service(&mut self, service: u32) {
        self.header.service = service;
    }

    /// Change the destination object.
    pub fn set_object(&mut self, object: u32) {
        self.header.object = object;
    }

    /// Change the action.
    pub fn set_action(&mut self, action: u32) {
        self.header.action = action;
    }

    /// Replace the flag bits.
    pub fn set_flags(&mut self, flags: u8) {
        self.header.flags = flags;
    }

    /// Payload.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Mutable payload, copied first if shared.
    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Replace the payload.
    pub fn set_buffer(&mut self, buffer: Buffer) {
        self.buffer = buffer;
    }

    /// Replace the payload with the encoding of `value`.
    pub fn set_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        self.buffer = to_buffer(value)?;
        Ok(())
    }

    /// Decode the payload as a `T`.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        from_buffer(&self.buffer)
    }

    /// Replace the payload with an error description.
    pub fn set_error(&mut self, description: &str) {
        // A string always encodes unless it exceeds 4GiB.
        if let Err(e) = self.set_value(description) {
            tracing::error!("Message::set_error cannot encode description: {}", e);
        }
    }

    /// Description carried by an error message.
    pub fn error_description(&self) -> Result<String, CodecError> {
        self.value()
    }

    /// Header ready to be written, with the size of the flattened payload.
    pub fn wire_header(&self) -> Result<MessageHeader, WireError> {
        let total = self.buffer.total_size();
        let size = u32::try_from(total).map_err(|_| WireError::PayloadTooLarge {
            size: total,
            max: u32::MAX as usize,
        })?;
        Ok(MessageHeader {
            size,
            ..self.header
        })
    }

    /// Reason why the message must be dropped, if any.
    pub fn validation_error(&self) -> Option<&'static str> {
        if self.header.magic != MAGIC {
            Some("invalid magic cookie")
        } else if self.header.object == object::NONE {
            Some("object id is 0")
        } else if self.message_type() == MessageType::None {
            Some("message type is None")
        } else {
            None
        }
    }

    /// True when the message may be processed.
    pub fn is_valid(&self) -> bool {
        self.validation_error().is_none()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id())
            .field("type", &self.message_type())
            .field("service", &self.service())
            .field("object", &self.object())
            .field("action", &self.action())
            .field("flags", &self.flags())
            .field("size", &self.buffer.total_size())
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.message_type(), self.address())
    }
}
