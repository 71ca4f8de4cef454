//! Access to the service directory, remote or in-process.

use std::sync::Arc;

use parking_lot::Mutex;
use qimessaging_core::from_buffer;
use qimessaging_transport::message::{object, service};
use qimessaging_transport::{
    Buffer, MessageSocket, ServiceInfo, SharedSocket, SocketConfig, SocketEvent, SocketId, Url,
    make_message_socket,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{RpcError, SessionError, SessionResult};
use crate::object::RemoteObject;

use super::service::{ServiceDirectory, method};

/// Notifications about the directory connection and its registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceDirectoryEvent {
    /// The client is connected and subscribed.
    Connected,
    /// The connection is gone.
    Disconnected(String),
    /// A service became ready.
    ServiceAdded(u32, String),
    /// A service was unregistered.
    ServiceRemoved(u32, String),
}

type Publish = fn(u32, String) -> ServiceDirectoryEvent;

enum Mode {
    Idle,
    Connecting,
    Remote {
        url: Url,
        socket: SharedSocket,
        object: RemoteObject,
        tasks: CancellationToken,
    },
    Local {
        directory: Arc<ServiceDirectory>,
        links: [u64; 2],
        tasks: CancellationToken,
    },
}

enum Target {
    Remote(RemoteObject),
    Local(Arc<ServiceDirectory>),
}

struct ClientInner {
    config: SocketConfig,
    mode: Mutex<Mode>,
    events: broadcast::Sender<ServiceDirectoryEvent>,
}

impl ClientInner {
    fn on_socket_disconnected(&self, socket_id: SocketId, reason: String) {
        let previous = {
            let mut mode = self.mode.lock();
            match &*mode {
                Mode::Remote { socket, .. } if socket.id() == socket_id => {
                    std::mem::replace(&mut *mode, Mode::Idle)
                }
                _ => return,
            }
        };
        if let Mode::Remote { object, tasks, .. } = previous {
            tasks.cancel();
            object.close();
        }
        tracing::info!("ServiceDirectoryClient disconnected: {}", reason);
        let _ = self.events.send(ServiceDirectoryEvent::Disconnected(reason));
    }
}

/// Client of the [`ServiceDirectory`].
///
/// In remote mode calls travel over a socket to service 1; in local mode
/// they go straight to an in-process directory. The API is the same.
///
/// Cloning yields another handle on the same client.
#[derive(Clone)]
pub struct ServiceDirectoryClient {
    inner: Arc<ClientInner>,
}

impl ServiceDirectoryClient {
    /// Create a disconnected client.
    pub fn new(config: SocketConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ClientInner {
                config,
                mode: Mutex::new(Mode::Idle),
                events,
            }),
        }
    }

    /// Subscribe to connection and registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceDirectoryEvent> {
        self.inner.events.subscribe()
    }

    fn begin(&self) -> SessionResult<()> {
        let mut mode = self.inner.mode.lock();
        match &*mode {
            Mode::Idle => {
                *mode = Mode::Connecting;
                Ok(())
            }
            _ => Err(SessionError::AlreadyConnected),
        }
    }

    /// Connect to the directory at `url`.
    ///
    /// Resolves once the socket is up, the directory's meta object is known
    /// and both registry signals are subscribed, so no `serviceAdded` or
    /// `serviceRemoved` emitted afterwards can be missed.
    pub async fn connect(&self, url: &Url) -> SessionResult<()> {
        self.begin()?;
        match self.establish(url).await {
            Ok(()) => {
                tracing::info!("ServiceDirectoryClient connected to {}", url);
                let _ = self.inner.events.send(ServiceDirectoryEvent::Connected);
                Ok(())
            }
            Err(error) => {
                let mut mode = self.inner.mode.lock();
                if matches!(*mode, Mode::Connecting) {
                    *mode = Mode::Idle;
                }
                tracing::warn!("ServiceDirectoryClient::connect {} failed: {}", url, error);
                Err(error)
            }
        }
    }

    async fn establish(&self, url: &Url) -> SessionResult<()> {
        let socket = make_message_socket(url, self.inner.config.clone());
        let socket_events = socket.subscribe();
        socket.connect(url).await?;

        let object = RemoteObject::new(socket.clone(), service::SERVICE_DIRECTORY, object::MAIN);
        let subscribed = async {
            object.fetch_meta_object().await?;
            let (_, added) = object.connect_signal(method::SERVICE_ADDED).await?;
            let (_, removed) = object.connect_signal(method::SERVICE_REMOVED).await?;
            Ok::<_, RpcError>((added, removed))
        };
        let (added, removed) = match subscribed.await {
            Ok(receivers) => receivers,
            Err(error) => {
                object.close();
                socket.disconnect().await;
                return Err(error.into());
            }
        };

        let tasks = CancellationToken::new();
        self.forward(added, removed, tasks.clone());
        tokio::spawn(watch_socket(
            Arc::downgrade(&self.inner),
            socket.id(),
            socket_events,
            tasks.clone(),
        ));

        let installed = {
            let mut mode = self.inner.mode.lock();
            if matches!(*mode, Mode::Connecting) {
                *mode = Mode::Remote {
                    url: url.clone(),
                    socket: socket.clone(),
                    object: object.clone(),
                    tasks: tasks.clone(),
                };
                true
            } else {
                false
            }
        };
        if !installed {
            // Closed while connecting.
            tasks.cancel();
            object.close();
            socket.disconnect().await;
            return Err(SessionError::Closed);
        }

        // The socket may have died before the watcher subscribed.
        if !socket.is_connected() {
            self.inner
                .on_socket_disconnected(socket.id(), "connection lost".to_string());
            return Err(SessionError::NotConnected);
        }
        Ok(())
    }

    /// Serve the API from an in-process directory.
    pub fn set_service_directory(&self, directory: Arc<ServiceDirectory>) -> SessionResult<()> {
        self.begin()?;
        let tasks = CancellationToken::new();
        let (added_link, added) = directory.hub().connect_local(method::SERVICE_ADDED);
        let (removed_link, removed) = directory.hub().connect_local(method::SERVICE_REMOVED);
        self.forward(added, removed, tasks.clone());
        *self.inner.mode.lock() = Mode::Local {
            directory,
            links: [added_link, removed_link],
            tasks,
        };
        tracing::debug!("ServiceDirectoryClient using the local service directory");
        let _ = self.inner.events.send(ServiceDirectoryEvent::Connected);
        Ok(())
    }

    /// Publish registry signals on the event channel.
    ///
    /// One task drains both receivers, `serviceAdded` first: an addition is
    /// always queued before the removal of the same id, so subscribers never
    /// see a removal ahead of its addition.
    fn forward(
        &self,
        mut added: mpsc::UnboundedReceiver<Buffer>,
        mut removed: mpsc::UnboundedReceiver<Buffer>,
        tasks: CancellationToken,
    ) {
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            let (mut added_open, mut removed_open) = (true, true);
            while added_open || removed_open {
                let (payload, event) = tokio::select! {
                    biased;
                    _ = tasks.cancelled() => break,
                    payload = added.recv(), if added_open => match payload {
                        Some(payload) => (payload, ServiceDirectoryEvent::ServiceAdded as Publish),
                        None => {
                            added_open = false;
                            continue;
                        }
                    },
                    payload = removed.recv(), if removed_open => match payload {
                        Some(payload) => (payload, ServiceDirectoryEvent::ServiceRemoved as Publish),
                        None => {
                            removed_open = false;
                            continue;
                        }
                    },
                };
                match from_buffer::<(u32, String)>(&payload) {
                    Ok((service_id, name)) => {
                        let _ = events.send(event(service_id, name));
                    }
                    Err(error) => {
                        tracing::warn!("ServiceDirectoryClient bad registry event: {}", error);
                    }
                }
            }
        });
    }

    fn target(&self) -> Result<Target, RpcError> {
        match &*self.inner.mode.lock() {
            Mode::Remote { object, .. } => Ok(Target::Remote(object.clone())),
            Mode::Local { directory, .. } => Ok(Target::Local(directory.clone())),
            Mode::Idle | Mode::Connecting => Err(RpcError::NotConnected),
        }
    }

    /// True in local mode or while the remote connection is up.
    pub fn is_connected(&self) -> bool {
        match &*self.inner.mode.lock() {
            Mode::Remote { socket, .. } => socket.is_connected(),
            Mode::Local { .. } => true,
            Mode::Idle | Mode::Connecting => false,
        }
    }

    /// True when serving an in-process directory.
    pub fn is_local(&self) -> bool {
        matches!(*self.inner.mode.lock(), Mode::Local { .. })
    }

    /// Url of the remote directory.
    pub fn url(&self) -> Option<Url> {
        match &*self.inner.mode.lock() {
            Mode::Remote { url, .. } => Some(url.clone()),
            _ => None,
        }
    }

    /// Socket to the remote directory.
    pub fn socket(&self) -> Option<SharedSocket> {
        match &*self.inner.mode.lock() {
            Mode::Remote { socket, .. } => Some(socket.clone()),
            _ => None,
        }
    }

    /// Description of the ready service called `name`.
    pub async fn service(&self, name: &str) -> Result<ServiceInfo, RpcError> {
        match self.target()? {
            Target::Remote(object) => object.call_typed(method::SERVICE, name).await,
            Target::Local(directory) => Ok(directory.service(name)?),
        }
    }

    /// Every ready service.
    pub async fn services(&self) -> Result<Vec<ServiceInfo>, RpcError> {
        match self.target()? {
            Target::Remote(object) => object.call_typed(method::SERVICES, &()).await,
            Target::Local(directory) => Ok(directory.services()),
        }
    }

    /// Register a service; it stays pending until [`service_ready`](Self::service_ready).
    pub async fn register_service(&self, info: &ServiceInfo) -> Result<u32, RpcError> {
        match self.target()? {
            Target::Remote(object) => object.call_typed(method::REGISTER_SERVICE, info).await,
            Target::Local(directory) => Ok(directory.register_service(info.clone(), None)?),
        }
    }

    /// Unregister a service.
    pub async fn unregister_service(&self, service_id: u32) -> Result<(), RpcError> {
        match self.target()? {
            Target::Remote(object) => {
                object
                    .call_typed(method::UNREGISTER_SERVICE, &service_id)
                    .await
            }
            Target::Local(directory) => Ok(directory.unregister_service(service_id)?),
        }
    }

    /// Mark a pending service ready.
    pub async fn service_ready(&self, service_id: u32) -> Result<(), RpcError> {
        match self.target()? {
            Target::Remote(object) => object.call_typed(method::SERVICE_READY, &service_id).await,
            Target::Local(directory) => Ok(directory.service_ready(service_id)?),
        }
    }

    /// Replace the description of a registered service.
    pub async fn update_service_info(&self, info: &ServiceInfo) -> Result<(), RpcError> {
        match self.target()? {
            Target::Remote(object) => object.call_typed(method::UPDATE_SERVICE_INFO, info).await,
            Target::Local(directory) => Ok(directory.update_service_info(info.clone())?),
        }
    }

    /// Machine id of the directory.
    pub async fn machine_id(&self) -> Result<String, RpcError> {
        match self.target()? {
            Target::Remote(object) => object.call_typed(method::MACHINE_ID, &()).await,
            Target::Local(directory) => Ok(directory.machine_id()),
        }
    }

    /// Drop the connection. Pending calls fail.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.mode.lock(), Mode::Idle);
        match previous {
            Mode::Remote {
                socket,
                object,
                tasks,
                ..
            } => {
                tasks.cancel();
                object.close();
                socket.disconnect().await;
            }
            Mode::Local {
                directory,
                links,
                tasks,
            } => {
                tasks.cancel();
                for link in links {
                    directory.hub().disconnect(link);
                }
            }
            Mode::Idle | Mode::Connecting => return,
        }
        let _ = self
            .inner
            .events
            .send(ServiceDirectoryEvent::Disconnected("closed".to_string()));
    }
}

async fn watch_socket(
    inner: std::sync::Weak<ClientInner>,
    socket_id: SocketId,
    mut events: broadcast::Receiver<SocketEvent>,
    tasks: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = tasks.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(SocketEvent::Disconnected { reason }) => {
                if let Some(inner) = inner.upgrade() {
                    inner.on_socket_disconnected(socket_id, reason);
                }
                return;
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

impl std::fmt::Debug for ServiceDirectoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDirectoryClient")
            .field("connected", &self.is_connected())
            .field("local", &self.is_local())
            .finish()
    }
}
