//! The trait implemented by objects served on the bus.

use std::sync::Arc;

use async_trait::async_trait;
use qimessaging_core::{from_buffer, to_buffer};
use qimessaging_transport::{Buffer, MessageSocket, ProcessContext, SharedSocket};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

use super::bound::ServiceBoundObject;
use super::host::ObjectHost;
use super::meta::MetaObject;
use super::signal::SignalHub;

/// An object whose methods can be called over the bus.
///
/// Arguments arrive as the encoded argument tuple and results leave as the
/// encoded return value; [`decode_args`] and [`encode_reply`] do the
/// conversions. Returning an error answers the caller with a `Type_Error`
/// carrying the error's text.
#[async_trait]
pub trait ServiceObject: Send + Sync + 'static {
    /// Method and signal table.
    fn meta_object(&self) -> MetaObject;

    /// Run method `action` with the encoded `args`.
    async fn call(&self, ctx: &CallContext, action: u32, args: Buffer) -> Result<Buffer, RpcError>;

    /// Hub the object emits its signals through, if it has any.
    fn signal_hub(&self) -> Option<&SignalHub> {
        None
    }

    /// Read a property.
    async fn property(&self, name: &str) -> Result<Buffer, RpcError> {
        Err(RpcError::PropertyNotFound(name.to_string()))
    }

    /// Write a property.
    async fn set_property(&self, name: &str, _value: Buffer) -> Result<(), RpcError> {
        Err(RpcError::PropertyNotFound(name.to_string()))
    }

    /// Names of the readable properties.
    fn properties(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called when a socket the object was served on goes away.
    fn socket_unbound(&self, _socket: &SharedSocket) {}
}

/// Shared handle on a served object.
pub type SharedObject = Arc<dyn ServiceObject>;

/// Decode the argument tuple of a call.
pub fn decode_args<T: DeserializeOwned>(args: &Buffer) -> Result<T, RpcError> {
    Ok(from_buffer(args)?)
}

/// Encode the return value of a call.
pub fn encode_reply<T: Serialize + ?Sized>(value: &T) -> Result<Buffer, RpcError> {
    Ok(to_buffer(value)?)
}

/// Serializable reference to an object living in another process.
///
/// Turned back into a proxy with
/// [`RemoteObject::from_object_ref`](super::RemoteObject::from_object_ref).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Service the object is reached through.
    pub service_id: u32,
    /// Object id within that service.
    pub object_id: u32,
    /// Methods and signals of the object.
    pub meta_object: MetaObject,
}

/// Information about the call being served.
#[derive(Clone)]
pub struct CallContext {
    service_id: u32,
    socket: Option<SharedSocket>,
    host: Option<ObjectHost>,
    context: Arc<ProcessContext>,
}

impl CallContext {
    /// Context of a call that arrived over `socket`.
    pub(crate) fn remote(
        service_id: u32,
        socket: SharedSocket,
        host: ObjectHost,
        context: Arc<ProcessContext>,
    ) -> Self {
        Self {
            service_id,
            socket: Some(socket),
            host: Some(host),
            context,
        }
    }

    /// Context of an in-process call.
    pub fn local(service_id: u32, context: Arc<ProcessContext>) -> Self {
        Self {
            service_id,
            socket: None,
            host: None,
            context,
        }
    }

    /// Service the call was addressed to.
    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    /// Socket of the caller, `None` for in-process calls.
    pub fn socket(&self) -> Option<&SharedSocket> {
        self.socket.as_ref()
    }

    /// Process identity.
    pub fn process_context(&self) -> &Arc<ProcessContext> {
        &self.context
    }

    /// Serve `object` to the caller and return a reference to send back.
    ///
    /// The object lives as long as the caller's connection, or until the
    /// caller terminates it.
    pub fn host_object(&self, object: SharedObject) -> Result<ObjectRef, RpcError> {
        let (Some(socket), Some(host)) = (&self.socket, &self.host) else {
            return Err(RpcError::Unsupported(
                "objects can only be handed out over a connection".to_string(),
            ));
        };
        let object_id = self.context.next_object_id();
        let bound = Arc::new(ServiceBoundObject::new(
            self.service_id,
            object_id,
            object,
            self.context.clone(),
        ));
        let meta_object = bound.meta_object();
        host.add(bound);
        tracing::debug!(
            "CallContext::host_object {}.{} for socket {}",
            self.service_id,
            object_id,
            socket.id()
        );
        Ok(ObjectRef {
            service_id: self.service_id,
            object_id,
            meta_object,
        })
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("service_id", &self.service_id)
            .field("socket", &self.socket.as_ref().map(|socket| socket.id()))
            .finish()
    }
}
