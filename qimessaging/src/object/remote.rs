//! Client side proxy of an object served by another process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use qimessaging_transport::message::action;
use qimessaging_transport::{
    Buffer, Message, MessageAddress, MessageSocket, MessageType, SharedSocket, SubscriptionId,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use crate::error::RpcError;

use super::meta::MetaObject;
use super::service::{ObjectRef, decode_args, encode_reply};

type Promise = oneshot::Sender<Result<Buffer, RpcError>>;

struct SignalLink {
    event: u32,
    sender: mpsc::UnboundedSender<Buffer>,
}

struct RemoteInner {
    service_id: u32,
    object_id: u32,
    socket: SharedSocket,
    subscription: Mutex<Option<SubscriptionId>>,
    promises: Mutex<HashMap<u32, Promise>>,
    signals: Mutex<HashMap<u64, SignalLink>>,
    meta_object: Mutex<MetaObject>,
    next_link: AtomicU64,
    closed: AtomicBool,
}

impl RemoteInner {
    fn on_message(&self, message: Message) {
        let outcome = match message.message_type() {
            MessageType::Reply => Ok(message.buffer().clone()),
            MessageType::Error => Err(match message.error_description() {
                Ok(description) => RpcError::Remote(description),
                Err(error) => RpcError::Codec(error),
            }),
            MessageType::Canceled => Err(RpcError::Canceled),
            MessageType::Event => {
                let event = message.action();
                self.signals.lock().retain(|_, link| {
                    link.event != event || link.sender.send(message.buffer().clone()).is_ok()
                });
                return;
            }
            other => {
                tracing::debug!(
                    "RemoteObject::on_message ignoring {} for {}",
                    other,
                    message.address()
                );
                return;
            }
        };
        // Several proxies may share a socket and an address; the promise
        // table tells which one issued the call.
        match self.promises.lock().remove(&message.id()) {
            Some(promise) => {
                let _ = promise.send(outcome);
            }
            None => tracing::trace!(
                "RemoteObject::on_message no promise for {}",
                message.address()
            ),
        }
    }

    fn unsubscribe(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            self.socket.dispatcher().message_pending_disconnect(
                self.service_id,
                self.object_id,
                subscription,
            );
        }
    }
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Proxy forwarding calls to an object in another process.
///
/// Every call gets exactly one outcome: the reply, the remote error, or the
/// disconnect error synthesized when the socket dies.
///
/// Cloning yields another handle on the same proxy.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<RemoteInner>,
}

impl RemoteObject {
    /// Proxy for `service_id.object_id` reached through `socket`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(socket: SharedSocket, service_id: u32, object_id: u32) -> Self {
        let inner = Arc::new(RemoteInner {
            service_id,
            object_id,
            socket: socket.clone(),
            subscription: Mutex::new(None),
            promises: Mutex::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
            meta_object: Mutex::new(MetaObject::default()),
            next_link: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        let weak: Weak<RemoteInner> = Arc::downgrade(&inner);
        let subscription = socket.dispatcher().message_pending_connect(
            service_id,
            object_id,
            move |message: Message| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_message(message);
                }
            },
        );
        *inner.subscription.lock() = Some(subscription);
        Self { inner }
    }

    /// Proxy for an object reference received in a reply.
    pub fn from_object_ref(socket: SharedSocket, object: &ObjectRef) -> Self {
        let remote = Self::new(socket, object.service_id, object.object_id);
        *remote.inner.meta_object.lock() = object.meta_object.clone();
        remote
    }

    /// Service id of the target.
    pub fn service_id(&self) -> u32 {
        self.inner.service_id
    }

    /// Object id of the target.
    pub fn object_id(&self) -> u32 {
        self.inner.object_id
    }

    /// Socket the proxy talks through.
    pub fn socket(&self) -> &SharedSocket {
        &self.inner.socket
    }

    /// True while the proxy is open and its socket connected.
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && self.inner.socket.is_connected()
    }

    /// Last fetched method and signal table.
    pub fn meta_object(&self) -> MetaObject {
        self.inner.meta_object.lock().clone()
    }

    /// Number of calls waiting for an answer.
    pub fn pending_calls(&self) -> usize {
        self.inner.promises.lock().len()
    }

    fn address(&self, action: u32) -> MessageAddress {
        MessageAddress::new(0, self.inner.service_id, self.inner.object_id, action)
    }

    /// Call `action` with an encoded argument tuple.
    pub async fn call(&self, action: u32, args: Buffer) -> Result<Buffer, RpcError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        let mut message = Message::new(MessageType::Call, self.address(action));
        message.set_buffer(args);
        let id = message.id();

        let (promise, answer) = oneshot::channel();
        self.inner.promises.lock().insert(id, promise);
        if let Err(error) = self.inner.socket.send(message) {
            self.inner.promises.lock().remove(&id);
            return Err(error.into());
        }
        answer.await.unwrap_or(Err(RpcError::Closed))
    }

    /// Call `action`, encoding `args` and decoding the result.
    pub async fn call_typed<A, R>(&self, action: u32, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self.call(action, encode_reply(args)?).await?;
        decode_args(&reply)
    }

    /// Call the method called `name`.
    pub async fn call_method<A, R>(&self, name: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let action = self
            .inner
            .meta_object
            .lock()
            .method_id(name)
            .ok_or_else(|| RpcError::NoSuchMethod(name.to_string()))?;
        self.call_typed(action, args).await
    }

    /// Send `action` without waiting for an answer.
    pub fn post<A: Serialize + ?Sized>(&self, action: u32, args: &A) -> Result<(), RpcError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        let mut message = Message::new(MessageType::Post, self.address(action));
        message.set_buffer(encode_reply(args)?);
        self.inner.socket.send(message)?;
        Ok(())
    }

    /// Fetch and remember the target's method and signal table.
    pub async fn fetch_meta_object(&self) -> Result<MetaObject, RpcError> {
        let meta: MetaObject = self
            .call_typed(action::META_OBJECT, &self.inner.object_id)
            .await?;
        *self.inner.meta_object.lock() = meta.clone();
        Ok(meta)
    }

    /// Subscribe to signal `event`.
    ///
    /// Returns once the target has acknowledged the subscription; emissions
    /// after that point arrive on the receiver as encoded payloads.
    pub async fn connect_signal(
        &self,
        event: u32,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Buffer>), RpcError> {
        let link = self.inner.next_link.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .signals
            .lock()
            .insert(link, SignalLink { event, sender });

        let registered: Result<u64, RpcError> = self
            .call_typed(
                action::REGISTER_EVENT,
                &(self.inner.object_id, event, link),
            )
            .await;
        match registered {
            Ok(_) => Ok((link, receiver)),
            Err(error) => {
                self.inner.signals.lock().remove(&link);
                Err(error)
            }
        }
    }

    /// Subscribe to the signal called `name`.
    pub async fn connect_signal_by_name(
        &self,
        name: &str,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Buffer>), RpcError> {
        let event = self
            .inner
            .meta_object
            .lock()
            .signal_id(name)
            .ok_or_else(|| RpcError::NoSuchSignal(name.to_string()))?;
        self.connect_signal(event).await
    }

    /// Cancel a subscription made with [`connect_signal`](Self::connect_signal).
    pub async fn disconnect_signal(&self, link: u64) -> Result<(), RpcError> {
        let Some(signal) = self.inner.signals.lock().remove(&link) else {
            return Err(RpcError::NoSuchSignal(format!("link {link}")));
        };
        self.call_typed::<_, ()>(
            action::UNREGISTER_EVENT,
            &(self.inner.object_id, signal.event, link),
        )
        .await
    }

    /// Ask the peer to drop a hosted object, then close the proxy.
    pub async fn terminate(&self) -> Result<(), RpcError> {
        let result = self
            .call_typed::<_, ()>(action::TERMINATE, &self.inner.object_id)
            .await;
        self.close();
        result
    }

    /// Stop using the proxy. Pending calls fail with [`RpcError::Closed`].
    ///
    /// The socket stays open; it may be shared with other proxies.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.unsubscribe();
        let promises: Vec<Promise> = self.inner.promises.lock().drain().map(|(_, p)| p).collect();
        for promise in promises {
            let _ = promise.send(Err(RpcError::Closed));
        }
        self.inner.signals.lock().clear();
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("service_id", &self.inner.service_id)
            .field("object_id", &self.inner.object_id)
            .field("socket", &self.inner.socket.id())
            .finish()
    }
}
