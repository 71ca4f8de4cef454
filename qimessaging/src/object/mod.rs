//! Object model: served objects, their wire binding and remote proxies.
//!
//! A process exposes a [`ServiceObject`] by wrapping it in a
//! [`ServiceBoundObject`], which the [`Server`](crate::Server) attaches to
//! every accepted socket. Other processes talk to it through a
//! [`RemoteObject`] proxy built from the object's [`MetaObject`].

mod bound;
mod host;
mod meta;
mod remote;
mod service;
mod signal;

pub use bound::ServiceBoundObject;
pub use host::ObjectHost;
pub use meta::{MetaMethod, MetaObject, MetaSignal};
pub use remote::RemoteObject;
pub use service::{CallContext, ObjectRef, ServiceObject, SharedObject, decode_args, encode_reply};
pub use signal::SignalHub;
