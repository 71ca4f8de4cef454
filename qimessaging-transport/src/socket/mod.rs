//! Message-oriented sockets.
//!
//! A [`MessageSocket`] carries framed [`Message`]s in both directions over
//! one connection. Incoming messages go to the socket's
//! [`MessageDispatcher`]; outgoing messages are queued and written one at a
//! time, in order.
//!
//! # Connection Lifecycle
//!
//! ```text
//!                connect()               established
//! ┌────────────┐ ─────────► ┌────────────┐ ─────────► ┌───────────┐
//! │Disconnected│            │ Connecting │            │ Connected │
//! │            │ ◄───────── │            │            │           │
//! └────────────┘  failure /  └────────────┘            └─────┬─────┘
//!       ▲         disconnect (Aborted)                        │ disconnect() /
//!       │                                                     │ I/O error
//!       │        teardown done             ┌─────────────┐    │
//!       └───────────────────────────────── │Disconnecting│ ◄──┘
//!                                          └─────────────┘
//! ```
//!
//! - A disconnect while connecting makes `connect()` fail with
//!   [`SocketError::Aborted`]; it never succeeds afterwards.
//! - Any number of concurrent `disconnect()` calls wait for the same
//!   teardown. [`SocketEvent::Disconnected`] is emitted once per connection,
//!   after pending calls have been failed through
//!   [`MessageDispatcher::clean_pending_messages`].
//! - A disconnected socket may connect again.
//!
//! # Framing
//!
//! The read loop reads a 28-byte header, rejects a bad magic cookie or an
//! oversized payload by failing the connection, reads exactly `size` bytes
//! into a fresh buffer, hands the message over and starts again.
//!
//! # Implementations
//!
//! [`TcpMessageSocket`] serves both `tcp` and `tcps` urls; use
//! [`make_message_socket`] to pick the implementation from a url.

/// Socket configuration
pub mod config;

/// Error types specific to socket operations
pub mod error;

/// TCP implementation of [`MessageSocket`]
pub mod tcp;

/// TLS setup for `tcps` endpoints
pub mod tls;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use qimessaging_core::{CapabilityMap, Protocol, Url};

use crate::dispatcher::MessageDispatcher;
use crate::message::Message;

pub use config::SocketConfig;
pub use error::{SocketError, SocketResult};
pub use tcp::TcpMessageSocket;
pub use tls::TlsConfig;

/// Byte stream a socket runs over: plain TCP or TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

/// Owned, type-erased stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Connection state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    /// No connection.
    Disconnected,
    /// Resolving, connecting or handshaking.
    Connecting,
    /// Ready to send and receive.
    Connected,
    /// Tearing the connection down.
    Disconnecting,
}

/// Notifications emitted by a socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The connection is established.
    Connected,
    /// The connection is gone; emitted once per connection.
    Disconnected {
        /// Why the connection ended.
        reason: String,
    },
    /// A valid message was read and dispatched.
    MessageReady(Message),
}

/// Process-unique socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SocketId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Full-duplex, message-oriented connection.
#[async_trait]
pub trait MessageSocket: Send + Sync + fmt::Debug {
    /// Process-unique identifier.
    fn id(&self) -> SocketId;

    /// Current connection state.
    fn status(&self) -> SocketStatus;

    /// True when messages can be sent.
    fn is_connected(&self) -> bool {
        self.status() == SocketStatus::Connected
    }

    /// Url of the remote end, once known.
    fn remote_url(&self) -> Option<Url>;

    /// Connect to `url`.
    ///
    /// Fails with a resolve, connect or handshake error, or with
    /// [`SocketError::Aborted`] if `disconnect()` is called meanwhile.
    async fn connect(&self, url: &Url) -> SocketResult<()>;

    /// Close the connection and wait until the teardown is complete.
    ///
    /// Safe to call concurrently and repeatedly.
    async fn disconnect(&self);

    /// Queue `message` for sending.
    ///
    /// Fails immediately with [`SocketError::NotConnected`] unless connected.
    fn send(&self, message: Message) -> SocketResult<()>;

    /// Start reading incoming messages.
    ///
    /// Accepted sockets wait for this call so that handlers can be bound
    /// first; client sockets read as soon as they are connected.
    fn start_reading(&self);

    /// Dispatcher receiving this socket's incoming messages.
    fn dispatcher(&self) -> &MessageDispatcher;

    /// Subscribe to connection events.
    fn subscribe(&self) -> broadcast::Receiver<SocketEvent>;

    /// Capabilities advertised by the remote end.
    fn remote_capabilities(&self) -> CapabilityMap;
}

/// Shared handle on any socket implementation.
pub type SharedSocket = Arc<dyn MessageSocket>;

/// Create an unconnected socket able to reach `url`.
pub fn make_message_socket(url: &Url, config: SocketConfig) -> SharedSocket {
    match url.protocol() {
        Protocol::Tcp | Protocol::Tcps => Arc::new(TcpMessageSocket::new(config)),
    }
}
