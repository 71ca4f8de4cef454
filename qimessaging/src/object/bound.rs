//! Server side of an object: turns wire messages into [`ServiceObject`] calls.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use qimessaging_transport::message::action;
use qimessaging_transport::{
    Buffer, Message, MessageSocket, MessageType, ProcessContext, SharedSocket, SocketId,
};

use crate::error::RpcError;

use super::host::ObjectHost;
use super::meta::MetaObject;
use super::service::{CallContext, SharedObject, decode_args, encode_reply};

/// Exposes a [`ServiceObject`](super::ServiceObject) under a service and
/// object id.
///
/// Besides user methods it answers the control actions every object has:
/// event registration, meta object, termination and properties.
pub struct ServiceBoundObject {
    service_id: u32,
    object_id: u32,
    object: SharedObject,
    context: Arc<ProcessContext>,
    // Per socket: link chosen by the peer -> link in the object's hub.
    links: Mutex<HashMap<SocketId, HashMap<u64, u64>>>,
}

impl ServiceBoundObject {
    /// Bind `object` as `service_id.object_id`.
    pub fn new(
        service_id: u32,
        object_id: u32,
        object: SharedObject,
        context: Arc<ProcessContext>,
    ) -> Self {
        Self {
            service_id,
            object_id,
            object,
            context,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Service id the object is served under.
    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    /// Object id within the service.
    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    /// The wrapped object.
    pub fn object(&self) -> &SharedObject {
        &self.object
    }

    /// Methods of the object plus the control methods.
    pub fn meta_object(&self) -> MetaObject {
        self.object.meta_object().with_control_methods()
    }

    /// Number of signal links held for `socket`.
    pub fn link_count(&self, socket: SocketId) -> usize {
        self.links.lock().get(&socket).map_or(0, HashMap::len)
    }

    /// Handle a message received on `socket`.
    ///
    /// A `Call` is answered with exactly one reply or error; a `Post` is
    /// never answered. The work runs on its own task.
    pub fn on_message(self: &Arc<Self>, socket: &SharedSocket, host: &ObjectHost, message: Message) {
        match message.message_type() {
            MessageType::Call => {
                let this = self.clone();
                let socket = socket.clone();
                let host = host.clone();
                tokio::spawn(async move {
                    let ctx = CallContext::remote(
                        this.service_id,
                        socket.clone(),
                        host.clone(),
                        this.context.clone(),
                    );
                    let answer = match this
                        .handle_call(&ctx, &host, message.action(), message.buffer().clone())
                        .await
                    {
                        Ok(payload) => {
                            let mut reply = Message::build_reply(&message);
                            reply.set_buffer(payload);
                            reply
                        }
                        Err(error) => {
                            tracing::debug!(
                                "ServiceBoundObject::on_message call {} failed: {}",
                                message.address(),
                                error
                            );
                            Message::build_error(&message, &error.to_string())
                        }
                    };
                    if let Err(error) = socket.send(answer) {
                        tracing::debug!(
                            "ServiceBoundObject::on_message answer to {} lost: {}",
                            message.address(),
                            error
                        );
                    }
                });
            }
            MessageType::Post => {
                let this = self.clone();
                let socket = socket.clone();
                let host = host.clone();
                tokio::spawn(async move {
                    this.handle_post(socket, host, message).await;
                });
            }
            MessageType::Cancel => {
                tracing::debug!(
                    "ServiceBoundObject::on_message ignoring cancel for {}",
                    message.address()
                );
            }
            other => {
                tracing::warn!(
                    "ServiceBoundObject::on_message unexpected {} message for {}",
                    other,
                    message.address()
                );
            }
        }
    }

    async fn handle_post(&self, socket: SharedSocket, host: ObjectHost, message: Message) {
        let event = message.action();
        let meta = self.object.meta_object();
        if meta.signal(event).is_some() {
            if let Some(hub) = self.object.signal_hub() {
                hub.emit_buffer(event, message.buffer().clone());
                return;
            }
        }
        if meta.method(event).is_some() {
            let ctx = CallContext::remote(self.service_id, socket, host.clone(), self.context.clone());
            if let Err(error) = self
                .handle_call(&ctx, &host, event, message.buffer().clone())
                .await
            {
                tracing::warn!(
                    "ServiceBoundObject::handle_post {} failed: {}",
                    message.address(),
                    error
                );
            }
            return;
        }
        tracing::warn!(
            "ServiceBoundObject::handle_post no such signal or method {}",
            message.address()
        );
    }

    async fn handle_call(
        &self,
        ctx: &CallContext,
        host: &ObjectHost,
        action_id: u32,
        args: Buffer,
    ) -> Result<Buffer, RpcError> {
        match action_id {
            action::REGISTER_EVENT => {
                let (_object, event, link): (u32, u32, u64) = decode_args(&args)?;
                self.register_event(ctx, event, link)
            }
            action::REGISTER_EVENT_WITH_SIGNATURE => {
                let (_object, event, link, _signature): (u32, u32, u64, String) =
                    decode_args(&args)?;
                self.register_event(ctx, event, link)
            }
            action::UNREGISTER_EVENT => {
                let (object, event, link): (u32, u32, u64) = decode_args(&args)?;
                self.unregister_event(ctx, object, event, link)?;
                encode_reply(&())
            }
            action::META_OBJECT => encode_reply(&self.meta_object()),
            action::TERMINATE => {
                let object_id: u32 = decode_args(&args)?;
                if let (Some(socket), Some(object)) = (ctx.socket(), host.remove(object_id)) {
                    object.socket_unbound(socket);
                }
                encode_reply(&())
            }
            action::GET_PROPERTY => {
                let name: String = decode_args(&args)?;
                self.object.property(&name).await
            }
            action::SET_PROPERTY => {
                let (name, value): (String, Buffer) = decode_args(&args)?;
                self.object.set_property(&name, value).await?;
                encode_reply(&())
            }
            action::PROPERTIES => encode_reply(&self.object.properties()),
            method if self.object.meta_object().method(method).is_some() => {
                self.object.call(ctx, method, args).await
            }
            method => Err(RpcError::NoSuchMethod(format!(
                "{}.{}.{}",
                self.service_id, self.object_id, method
            ))),
        }
    }

    fn register_event(&self, ctx: &CallContext, event: u32, link: u64) -> Result<Buffer, RpcError> {
        let no_such_signal = || {
            RpcError::NoSuchSignal(format!("{}.{}.{}", self.service_id, self.object_id, event))
        };
        if self.object.meta_object().signal(event).is_none() {
            return Err(no_such_signal());
        }
        let hub = self.object.signal_hub().ok_or_else(no_such_signal)?;
        let socket = ctx.socket().ok_or_else(|| {
            RpcError::Unsupported("remote event registration needs a connection".to_string())
        })?;

        let local = hub.connect_remote(event, socket.clone(), self.service_id, self.object_id);
        let replaced = self
            .links
            .lock()
            .entry(socket.id())
            .or_default()
            .insert(link, local);
        if let Some(previous) = replaced {
            hub.disconnect(previous);
        }
        tracing::debug!(
            "ServiceBoundObject::register_event {}.{} event {} link {} for {}",
            self.service_id,
            self.object_id,
            event,
            link,
            socket.id()
        );
        encode_reply(&link)
    }

    fn unregister_event(
        &self,
        ctx: &CallContext,
        object: u32,
        event: u32,
        link: u64,
    ) -> Result<(), RpcError> {
        let removed = ctx.socket().and_then(|socket| {
            let mut links = self.links.lock();
            let per_socket = links.get_mut(&socket.id())?;
            let local = per_socket.remove(&link);
            if per_socket.is_empty() {
                links.remove(&socket.id());
            }
            local
        });
        match (removed, self.object.signal_hub()) {
            (Some(local), Some(hub)) => {
                hub.disconnect(local);
                Ok(())
            }
            _ => Err(RpcError::Failed(format!(
                "Unregister request failed for {link} {object} {event}"
            ))),
        }
    }

    /// Forget every signal link made through `socket` and notify the object.
    pub fn socket_unbound(&self, socket: &SharedSocket) {
        let links = self.links.lock().remove(&socket.id());
        if let (Some(links), Some(hub)) = (links, self.object.signal_hub()) {
            for local in links.into_values() {
                hub.disconnect(local);
            }
        }
        self.object.socket_unbound(socket);
    }
}

impl std::fmt::Debug for ServiceBoundObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBoundObject")
            .field("service_id", &self.service_id)
            .field("object_id", &self.object_id)
            .finish()
    }
}
