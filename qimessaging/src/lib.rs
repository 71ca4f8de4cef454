//! # qimessaging
//!
//! Service bus middleware: processes publish named services through a
//! service directory, and any process can call their methods and subscribe
//! to their signals over TCP or TLS.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              qimessaging (this crate)                       │
//! │   Session • ServiceDirectory • Server • remote objects      │
//! ├─────────────────────────────────────────────────────────────┤
//! │              qimessaging-transport                          │
//! │   Wire format • MessageSocket (TCP/TLS) • dispatcher        │
//! │   TransportServer • TransportSocketCache                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │              qimessaging-core                               │
//! │   Binary codec • Buffer • Url • ServiceInfo • capabilities  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use qimessaging::prelude::*;
//!
//! let directory = Session::new(SessionConfig::local_network());
//! let endpoints = directory
//!     .listen_standalone(&[Url::parse("tcp://127.0.0.1:0")?])
//!     .await?;
//!
//! let client = Session::new(SessionConfig::local_network());
//! client.connect(&endpoints[0]).await?;
//! let echo = client.service("echo").await?;
//! let reply: String = echo.call_method("reply", &("hello",)).await?;
//! ```
//!
//! ## Modules
//!
//! - [`session`] - Entry point: connect, listen, register, resolve
//! - [`directory`] - The service registry and its client
//! - [`object`] - Serving local objects and calling remote ones
//! - [`server`] - Routes incoming messages to bound objects
//! - [`registrar`] - Publishes local services

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export all public items from sub-crates
pub use qimessaging_core::{
    BufferReader, CapabilityMap, CapabilityValue, DEFAULT_PORT, MAIN_OBJECT_ID,
    default_capabilities, from_buffer, is_internal_service, to_buffer,
};
pub use qimessaging_transport::*;

pub mod directory;
pub mod error;
pub mod logging;
pub mod object;
pub mod prelude;
pub mod registrar;
pub mod server;
pub mod session;

pub use directory::{
    SERVICE_DIRECTORY_NAME, ServiceDirectory, ServiceDirectoryClient, ServiceDirectoryEvent,
};
pub use error::{DirectoryError, RpcError, SessionError, SessionResult};
pub use object::{
    CallContext, MetaMethod, MetaObject, MetaSignal, ObjectHost, ObjectRef, RemoteObject,
    ServiceBoundObject, ServiceObject, SharedObject, SignalHub, decode_args, encode_reply,
};
pub use registrar::ObjectRegistrar;
pub use server::Server;
pub use session::{LocalObject, ObjectHandle, Session, SessionConfig};
