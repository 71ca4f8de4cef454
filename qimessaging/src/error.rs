//! Error types for objects, the service directory and sessions.

use qimessaging_transport::{CodecError, ServerError, SocketCacheError, SocketError};
use thiserror::Error;

/// Errors returned by calls on local or remote objects.
///
/// `Clone` so one failure can complete every waiter of a shared future.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// The peer answered with a `Type_Error` message.
    #[error("{0}")]
    Remote(String),

    /// The object has no method with this id or name.
    #[error("No such method {0}")]
    NoSuchMethod(String),

    /// The object has no signal with this id or name.
    #[error("No such signal {0}")]
    NoSuchSignal(String),

    /// Property lookup failed.
    #[error("property not found: {0}")]
    PropertyNotFound(String),

    /// No connection is available for the call.
    #[error("not connected")]
    NotConnected,

    /// The proxy was closed while the call was pending.
    #[error("object closed")]
    Closed,

    /// The peer canceled the call.
    #[error("call canceled")]
    Canceled,

    /// The operation needs a connection but runs locally.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Handler failure with a free-form description.
    #[error("{0}")]
    Failed(String),

    /// Sending failed.
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// Arguments or result could not be converted.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Registry violations reported by the service directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// A service with this name is already registered.
    #[error(
        "Service \"{name}\" (#{service_id}) is already registered. Rejecting conflicting registration attempt."
    )]
    AlreadyRegistered {
        /// Requested name.
        name: String,
        /// Id of the registered service.
        service_id: u32,
    },

    /// No service has this name.
    #[error("Cannot find service '{0}' in index")]
    UnknownService(String),

    /// The service is registered but not ready yet.
    #[error("Cannot find ServiceInfo for service '{0}'")]
    NotReady(String),

    /// Unregistering an id that is neither pending nor ready.
    #[error("Unregister Service: Can't find service #{0}")]
    CannotUnregister(u32),

    /// `serviceReady` for an id that is not pending.
    #[error("Can't find pending service #{0}")]
    NotPending(u32),

    /// `updateServiceInfo` for an unknown id.
    #[error("updateServiceInfo: Can't find service #{0}")]
    CannotUpdate(u32),

    /// `updateServiceInfo` carrying another name than the registered one.
    #[error("updateServiceInfo: service #{service_id} is \"{name}\", refusing to rename it to \"{requested}\"")]
    Renamed {
        /// Id of the service.
        service_id: u32,
        /// Registered name.
        name: String,
        /// Name carried by the update.
        requested: String,
    },
}

impl From<DirectoryError> for RpcError {
    fn from(error: DirectoryError) -> Self {
        RpcError::Remote(error.to_string())
    }
}

/// Errors surfaced by [`Session`](crate::Session) operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// A call failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The local service directory refused the request.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Connecting or sending failed.
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// Listening failed.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// No connection to the service could be established.
    #[error(transparent)]
    Cache(#[from] SocketCacheError),

    /// The session has no service directory.
    #[error("Session not connected to a service directory")]
    NotConnected,

    /// Registering a service before listening.
    #[error("Session is not listening, cannot register a service")]
    NotListening,

    /// A service directory is already hosted or connected.
    #[error("Session is already connected")]
    AlreadyConnected,

    /// The session was closed.
    #[error("Session is closed")]
    Closed,
}

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
