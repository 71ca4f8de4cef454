//! Common imports for services and clients.
//!
//! ```ignore
//! use qimessaging::prelude::*;
//! ```

pub use crate::directory::{ServiceDirectory, ServiceDirectoryClient, ServiceDirectoryEvent};
pub use crate::error::{DirectoryError, RpcError, SessionError};
pub use crate::object::{
    CallContext, MetaObject, ObjectRef, RemoteObject, ServiceObject, SharedObject, SignalHub,
    decode_args, encode_reply,
};
pub use crate::session::{ObjectHandle, Session, SessionConfig};
pub use qimessaging_transport::{Buffer, Protocol, ServiceInfo, Url};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
pub use std::sync::Arc;
pub use std::time::Duration;

/// Result of session-level operations.
pub type Result<T> = std::result::Result<T, SessionError>;
