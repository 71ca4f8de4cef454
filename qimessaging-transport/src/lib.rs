//! # qimessaging transport layer
//!
//! Moves [`Message`]s between processes.
//!
//! This crate provides:
//! - **Wire format**: the 28-byte header and frame encoding
//! - **MessageDispatcher**: routing of incoming messages to subscribers and
//!   error synthesis for calls lost on disconnect
//! - **Sockets**: the [`MessageSocket`] trait and its TCP/TLS implementation
//! - **TransportServer**: listening endpoints producing accepted sockets
//! - **TransportSocketCache**: one shared connection per remote machine

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use qimessaging_core::{
    Buffer, BufferError, CapabilityMap, CapabilityValue, CodecError, ProcessContext, Protocol,
    ServiceInfo, Url, UrlError,
};

// =============================================================================
// Modules
// =============================================================================

/// Message routing and in-flight call tracking.
pub mod dispatcher;

/// Message envelope and well-known ids.
pub mod message;

/// Listening endpoints.
pub mod server;

/// Message sockets over TCP and TLS.
pub mod socket;

/// Connection reuse per remote machine.
pub mod socket_cache;

/// Header layout and frame codec.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Dispatcher exports
pub use dispatcher::{
    ALL_OBJECTS, DISCONNECTED_ERROR, MessageDispatcher, MessageHandler, SubscriptionId,
};

// Message exports
pub use message::{Message, MessageAddress, MessageType, next_message_id};

// Server exports
pub use server::{ServerConfig, ServerError, ServerEvent, TransportServer};

// Socket exports
pub use socket::{
    MessageSocket, SharedSocket, SocketConfig, SocketError, SocketEvent, SocketId, SocketResult,
    SocketStatus, TcpMessageSocket, TlsConfig, make_message_socket,
};

// Socket cache exports
pub use socket_cache::{SocketCacheError, SocketFuture, TransportSocketCache, filter_endpoints};

// Wire format exports
pub use wire::{
    HEADER_SIZE, MAGIC, MessageHeader, PROTOCOL_VERSION, WireError, encode_message,
    try_decode_message,
};
