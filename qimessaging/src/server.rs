//! Object server: serves bound objects on every accepted connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use qimessaging_transport::message::{action, object, service};
use qimessaging_transport::{
    ALL_OBJECTS, CapabilityMap, CapabilityValue, Message, MessageSocket, MessageType,
    ProcessContext, ServerConfig, ServerError, ServerEvent, SharedSocket, SocketEvent, SocketId,
    SubscriptionId, TransportServer, Url,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::object::{ObjectHost, ServiceBoundObject, SharedObject};

/// Capability reporting the authentication state to clients.
pub const AUTH_STATE_KEY: &str = "__qi_auth_state";

/// Authentication finished.
pub const AUTH_STATE_DONE: i64 = 3;

struct SocketBinding {
    socket: SharedSocket,
    host: ObjectHost,
    control: SubscriptionId,
    subscriptions: Vec<(u32, SubscriptionId)>,
    watcher: CancellationToken,
}

struct ServerInner {
    context: Arc<ProcessContext>,
    transport: TransportServer,
    capabilities: CapabilityMap,
    objects: Mutex<BTreeMap<u32, Arc<ServiceBoundObject>>>,
    sockets: Mutex<HashMap<SocketId, SocketBinding>>,
    shutdown: CancellationToken,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serves [`ServiceBoundObject`]s to the peers of accepted sockets.
///
/// Each accepted socket gets one dispatcher subscription per served service
/// plus one for service 0, which the server answers itself. Objects handed
/// out during calls live in the socket's [`ObjectHost`]. When a socket
/// disconnects its subscriptions, hosted objects and signal links go with it.
///
/// Cloning yields another handle on the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server. Nothing is accepted until [`listen`](Self::listen).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(context: Arc<ProcessContext>, config: impl Into<ServerConfig>) -> Self {
        let config = config.into();
        let capabilities = config.socket.capabilities.clone();
        let transport = TransportServer::new(config);
        let incoming = transport.new_connections();
        let inner = Arc::new(ServerInner {
            context,
            transport,
            capabilities,
            objects: Mutex::new(BTreeMap::new()),
            sockets: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        if let Some(incoming) = incoming {
            tokio::spawn(accept_loop(
                Arc::downgrade(&inner),
                incoming,
                inner.shutdown.clone(),
            ));
        }
        Self { inner }
    }

    /// Listen on `url` and return the urls it is reachable at.
    pub async fn listen(&self, url: &Url) -> Result<Vec<Url>, ServerError> {
        self.inner.transport.listen(url).await
    }

    /// Urls the server is reachable at.
    pub fn endpoints(&self) -> Vec<Url> {
        self.inner.transport.endpoints()
    }

    /// Endpoint change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.transport.subscribe()
    }

    /// True once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of sockets currently served.
    pub fn socket_count(&self) -> usize {
        self.inner.sockets.lock().len()
    }

    /// Serve `object` as the main object of `service_id`.
    ///
    /// Returns false if the service id is taken.
    pub fn add_object(&self, service_id: u32, object: SharedObject) -> bool {
        self.add_bound_object(Arc::new(ServiceBoundObject::new(
            service_id,
            object::MAIN,
            object,
            self.inner.context.clone(),
        )))
    }

    /// Serve an already bound object.
    pub fn add_bound_object(&self, bound: Arc<ServiceBoundObject>) -> bool {
        let mut objects = self.inner.objects.lock();
        if objects.contains_key(&bound.service_id()) {
            tracing::warn!(
                "Server::add_bound_object service #{} already served",
                bound.service_id()
            );
            return false;
        }
        objects.insert(bound.service_id(), bound.clone());
        let mut sockets = self.inner.sockets.lock();
        for binding in sockets.values_mut() {
            let subscription = subscribe_object(&binding.socket, &binding.host, &bound);
            binding
                .subscriptions
                .push((bound.service_id(), subscription));
        }
        tracing::debug!("Server::add_bound_object service #{}", bound.service_id());
        true
    }

    /// Stop serving `service_id`.
    pub fn remove_object(&self, service_id: u32) -> bool {
        let Some(bound) = self.inner.objects.lock().remove(&service_id) else {
            return false;
        };
        let sockets: Vec<SharedSocket> = {
            let mut sockets = self.inner.sockets.lock();
            sockets
                .values_mut()
                .map(|binding| {
                    binding.subscriptions.retain(|(served, subscription)| {
                        if *served != service_id {
                            return true;
                        }
                        binding.socket.dispatcher().message_pending_disconnect(
                            service_id,
                            ALL_OBJECTS,
                            *subscription,
                        );
                        false
                    });
                    binding.socket.clone()
                })
                .collect()
        };
        for socket in &sockets {
            bound.socket_unbound(socket);
        }
        tracing::debug!("Server::remove_object service #{}", service_id);
        true
    }

    /// The object served as `service_id`.
    pub fn object(&self, service_id: u32) -> Option<Arc<ServiceBoundObject>> {
        self.inner.objects.lock().get(&service_id).cloned()
    }

    /// Serve every object on an accepted socket and start reading from it.
    pub fn add_incoming_socket(&self, socket: SharedSocket) {
        if self.bind_socket(&socket) {
            socket.start_reading();
        } else {
            tokio::spawn(async move { socket.disconnect().await });
        }
    }

    /// Serve every object on a socket this process connected.
    pub fn add_outgoing_socket(&self, socket: SharedSocket) -> bool {
        if !self.bind_socket(&socket) {
            return false;
        }
        if !socket.is_connected() {
            self.remove_socket(socket.id());
            return false;
        }
        true
    }

    fn bind_socket(&self, socket: &SharedSocket) -> bool {
        if self.is_closed() {
            tracing::debug!("Server::bind_socket refusing {} while closed", socket.id());
            return false;
        }
        let events = socket.subscribe();
        let host = ObjectHost::new();
        let control = subscribe_control(socket, self.inner.capabilities.clone());
        let watcher = self.inner.shutdown.child_token();
        {
            let objects = self.inner.objects.lock();
            let subscriptions = objects
                .values()
                .map(|bound| (bound.service_id(), subscribe_object(socket, &host, bound)))
                .collect();
            self.inner.sockets.lock().insert(
                socket.id(),
                SocketBinding {
                    socket: socket.clone(),
                    host,
                    control,
                    subscriptions,
                    watcher: watcher.clone(),
                },
            );
        }
        tokio::spawn(watch_socket(
            Arc::downgrade(&self.inner),
            socket.id(),
            events,
            watcher,
        ));
        tracing::debug!("Server::bind_socket {}", socket.id());
        true
    }

    /// Stop serving `socket` and drop what was hosted for it.
    pub fn remove_socket(&self, socket: SocketId) -> bool {
        remove_socket(&self.inner, socket).is_some()
    }

    /// Stop accepting and disconnect every served socket.
    pub async fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        tracing::debug!("Server::close");
        self.inner.shutdown.cancel();
        self.inner.transport.close();
        let ids: Vec<SocketId> = self.inner.sockets.lock().keys().copied().collect();
        for id in ids {
            if let Some(socket) = remove_socket(&self.inner, id) {
                socket.disconnect().await;
            }
        }
    }
}

fn remove_socket(inner: &ServerInner, id: SocketId) -> Option<SharedSocket> {
    let binding = inner.sockets.lock().remove(&id)?;
    let socket = binding.socket;
    binding.watcher.cancel();
    let dispatcher = socket.dispatcher();
    dispatcher.message_pending_disconnect(service::SERVER, ALL_OBJECTS, binding.control);
    for (service_id, subscription) in binding.subscriptions {
        dispatcher.message_pending_disconnect(service_id, ALL_OBJECTS, subscription);
    }
    binding.host.clear(&socket);
    let objects: Vec<_> = inner.objects.lock().values().cloned().collect();
    for bound in objects {
        bound.socket_unbound(&socket);
    }
    tracing::debug!("Server::remove_socket {}", id);
    Some(socket)
}

fn subscribe_object(
    socket: &SharedSocket,
    host: &ObjectHost,
    bound: &Arc<ServiceBoundObject>,
) -> SubscriptionId {
    let weak_socket = Arc::downgrade(socket);
    let weak_bound = Arc::downgrade(bound);
    let host = host.clone();
    socket.dispatcher().message_pending_connect(
        bound.service_id(),
        ALL_OBJECTS,
        move |message: Message| {
            let (Some(socket), Some(bound)) = (weak_socket.upgrade(), weak_bound.upgrade()) else {
                return;
            };
            if message.object() == bound.object_id() {
                bound.on_message(&socket, &host, message);
            } else {
                host.on_message(&socket, message);
            }
        },
    )
}

fn subscribe_control(socket: &SharedSocket, capabilities: CapabilityMap) -> SubscriptionId {
    let weak_socket = Arc::downgrade(socket);
    socket.dispatcher().message_pending_connect(
        service::SERVER,
        ALL_OBJECTS,
        move |message: Message| {
            if let Some(socket) = weak_socket.upgrade() {
                on_control_message(&socket, &capabilities, message);
            }
        },
    )
}

fn on_control_message(socket: &SharedSocket, capabilities: &CapabilityMap, message: Message) {
    if message.message_type() != MessageType::Call {
        tracing::debug!(
            "Server::on_control_message ignoring {}",
            message.address()
        );
        return;
    }
    let reply = match message.action() {
        action::SERVER_CONNECT => Message::build_reply(&message),
        action::SERVER_AUTHENTICATE => {
            let mut answer = capabilities.clone();
            answer.insert(
                AUTH_STATE_KEY.to_string(),
                CapabilityValue::Int(AUTH_STATE_DONE),
            );
            let mut reply = Message::build_reply(&message);
            match reply.set_value(&answer) {
                Ok(()) => reply,
                Err(error) => Message::build_error(&message, &error.to_string()),
            }
        }
        other => Message::build_error(&message, &format!("Unknown server action {other}")),
    };
    if let Err(error) = socket.send(reply) {
        tracing::debug!("Server::on_control_message reply lost: {}", error);
    }
}

async fn accept_loop(
    inner: Weak<ServerInner>,
    mut incoming: mpsc::UnboundedReceiver<SharedSocket>,
    shutdown: CancellationToken,
) {
    loop {
        let socket = tokio::select! {
            _ = shutdown.cancelled() => return,
            socket = incoming.recv() => match socket {
                Some(socket) => socket,
                None => return,
            },
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        tracing::debug!("Server::accept_loop new connection {}", socket.id());
        Server { inner }.add_incoming_socket(socket);
    }
}

async fn watch_socket(
    inner: Weak<ServerInner>,
    id: SocketId,
    mut events: broadcast::Receiver<SocketEvent>,
    watcher: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = watcher.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(SocketEvent::Disconnected { reason }) => {
                tracing::debug!("Server socket {} disconnected: {}", id, reason);
                if let Some(inner) = inner.upgrade() {
                    remove_socket(&inner, id);
                }
                return;
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("objects", &self.inner.objects.lock().len())
            .field("sockets", &self.socket_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
