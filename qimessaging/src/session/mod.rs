//! Sessions: the application entry point to the bus.

mod config;
mod resolver;

pub use config::{DEFAULT_LISTEN_URL, DEFAULT_URL, ENV_LISTEN_URL, ENV_URL, SessionConfig};
pub use resolver::{RequestId, ServiceResolver};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use qimessaging_transport::message::service;
use qimessaging_transport::{
    Buffer, ProcessContext, Protocol, ServerEvent, ServiceInfo, TransportSocketCache, Url,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::directory::{
    SERVICE_DIRECTORY_NAME, ServiceDirectory, ServiceDirectoryClient, ServiceDirectoryEvent,
};
use crate::error::{RpcError, SessionError, SessionResult};
use crate::object::{
    CallContext, MetaObject, RemoteObject, SharedObject, decode_args, encode_reply,
};
use crate::registrar::ObjectRegistrar;
use crate::server::Server;

/// An object registered in this process, called without a connection.
#[derive(Clone)]
pub struct LocalObject {
    service_id: u32,
    object: SharedObject,
    context: Arc<ProcessContext>,
}

impl LocalObject {
    /// Wrap `object`, served as `service_id`.
    pub fn new(service_id: u32, object: SharedObject, context: Arc<ProcessContext>) -> Self {
        Self {
            service_id,
            object,
            context,
        }
    }

    /// The wrapped object.
    pub fn object(&self) -> &SharedObject {
        &self.object
    }

    /// Call method `action` with an encoded argument tuple.
    pub async fn call(&self, action: u32, args: Buffer) -> Result<Buffer, RpcError> {
        if self.object.meta_object().method(action).is_none() {
            return Err(RpcError::NoSuchMethod(format!(
                "{}.1.{}",
                self.service_id, action
            )));
        }
        let ctx = CallContext::local(self.service_id, self.context.clone());
        self.object.call(&ctx, action, args).await
    }
}

/// A service as returned by [`Session::service`].
#[derive(Clone)]
pub enum ObjectHandle {
    /// Registered by this session.
    Local(LocalObject),
    /// Served by another process.
    Remote(RemoteObject),
}

impl ObjectHandle {
    /// Method and signal table.
    pub fn meta_object(&self) -> MetaObject {
        match self {
            ObjectHandle::Local(local) => local.object.meta_object(),
            ObjectHandle::Remote(remote) => remote.meta_object(),
        }
    }

    /// Service id of the target.
    pub fn service_id(&self) -> u32 {
        match self {
            ObjectHandle::Local(local) => local.service_id,
            ObjectHandle::Remote(remote) => remote.service_id(),
        }
    }

    /// True for objects of this process.
    pub fn is_local(&self) -> bool {
        matches!(self, ObjectHandle::Local(_))
    }

    /// The proxy, for remote objects.
    pub fn as_remote(&self) -> Option<&RemoteObject> {
        match self {
            ObjectHandle::Remote(remote) => Some(remote),
            ObjectHandle::Local(_) => None,
        }
    }

    /// Call method `action` with an encoded argument tuple.
    pub async fn call(&self, action: u32, args: Buffer) -> Result<Buffer, RpcError> {
        match self {
            ObjectHandle::Local(local) => local.call(action, args).await,
            ObjectHandle::Remote(remote) => remote.call(action, args).await,
        }
    }

    /// Call the method called `name`.
    pub async fn call_method<A, R>(&self, name: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let action = self
            .meta_object()
            .method_id(name)
            .ok_or_else(|| RpcError::NoSuchMethod(name.to_string()))?;
        let reply = self.call(action, encode_reply(args)?).await?;
        decode_args(&reply)
    }
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectHandle::Local(local) => f
                .debug_struct("Local")
                .field("service_id", &local.service_id)
                .finish(),
            ObjectHandle::Remote(remote) => std::fmt::Debug::fmt(remote, f),
        }
    }
}

struct SessionInner {
    context: Arc<ProcessContext>,
    config: SessionConfig,
    directory: ServiceDirectoryClient,
    socket_cache: TransportSocketCache,
    resolver: ServiceResolver,
    server: Server,
    registrar: ObjectRegistrar,
    local_directory: Mutex<Option<Arc<ServiceDirectory>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connection of a process to the bus.
///
/// A session either connects to a remote service directory
/// ([`connect`](Self::connect)) or hosts one
/// ([`listen_standalone`](Self::listen_standalone)). Once listening it can
/// register services; [`service`](Self::service) resolves names to local
/// objects or remote proxies.
///
/// Cloning yields another handle on the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session for this process.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_context(ProcessContext::new(), config)
    }

    /// Create a session sharing `context`.
    pub fn with_context(context: Arc<ProcessContext>, config: SessionConfig) -> Self {
        let directory = ServiceDirectoryClient::new(config.socket.clone());
        let socket_cache = TransportSocketCache::new(context.clone(), config.socket.clone());
        socket_cache.init();
        let resolver = ServiceResolver::new(directory.clone(), socket_cache.clone());
        let server = Server::new(context.clone(), config.server_config());
        let registrar = ObjectRegistrar::new(context.clone(), server.clone(), directory.clone());
        Self {
            inner: Arc::new(SessionInner {
                context,
                config,
                directory,
                socket_cache,
                resolver,
                server,
                registrar,
                local_directory: Mutex::new(None),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    /// Connect to the configured directory and listen on the configured urls.
    pub async fn start(&self) -> SessionResult<()> {
        let url = self.inner.config.directory_url.clone();
        self.connect(&url).await?;
        for url in self.inner.config.listen_urls.clone() {
            self.listen(&url).await?;
        }
        Ok(())
    }

    /// Connect to the service directory at `url`.
    pub async fn connect(&self, url: &Url) -> SessionResult<()> {
        self.ensure_open()?;
        self.inner.directory.connect(url).await
    }

    /// Serve registered services on `url`. Returns the reachable urls.
    pub async fn listen(&self, url: &Url) -> SessionResult<Vec<Url>> {
        self.ensure_open()?;
        if !self.inner.directory.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.inner.server.listen(url).await?;
        Ok(self.inner.server.endpoints())
    }

    /// Host a service directory and serve it on `urls`.
    pub async fn listen_standalone(&self, urls: &[Url]) -> SessionResult<Vec<Url>> {
        self.ensure_open()?;
        if self.inner.directory.is_connected() || self.inner.local_directory.lock().is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        let directory = ServiceDirectory::new(self.inner.context.clone());
        if !self
            .inner
            .server
            .add_object(service::SERVICE_DIRECTORY, directory.clone())
        {
            return Err(SessionError::AlreadyConnected);
        }
        for url in urls {
            if let Err(error) = self.inner.server.listen(url).await {
                self.inner.server.remove_object(service::SERVICE_DIRECTORY);
                return Err(error.into());
            }
        }
        let endpoints = self.inner.server.endpoints();
        advertise_directory(&directory, endpoints.clone())?;
        tokio::spawn(track_directory_endpoints(
            Arc::downgrade(&directory),
            self.inner.server.subscribe(),
            self.inner.shutdown.clone(),
        ));

        self.inner
            .directory
            .set_service_directory(directory.clone())?;
        *self.inner.local_directory.lock() = Some(directory);
        tracing::info!(
            "Session hosting the service directory on {:?}",
            endpoints.iter().map(ToString::to_string).collect::<Vec<_>>()
        );
        Ok(endpoints)
    }

    /// Register `object` as `name` and return its service id.
    pub async fn register_service(&self, name: &str, object: SharedObject) -> SessionResult<u32> {
        self.ensure_open()?;
        self.inner.registrar.register_service(name, object).await
    }

    /// Unregister a service registered by this session.
    pub async fn unregister_service(&self, service_id: u32) -> SessionResult<()> {
        self.ensure_open()?;
        self.inner.registrar.unregister_service(service_id).await
    }

    /// The service called `name`.
    pub async fn service(&self, name: &str) -> SessionResult<ObjectHandle> {
        self.service_with_protocol(name, None).await
    }

    /// The service called `name`, reached over `protocol` if remote.
    pub async fn service_with_protocol(
        &self,
        name: &str,
        protocol: Option<Protocol>,
    ) -> SessionResult<ObjectHandle> {
        self.ensure_open()?;
        if let Some((service_id, object)) = self.inner.registrar.registered_object(name) {
            return Ok(ObjectHandle::Local(LocalObject::new(
                service_id,
                object,
                self.inner.context.clone(),
            )));
        }
        if name == SERVICE_DIRECTORY_NAME {
            if let Some(directory) = self.inner.local_directory.lock().clone() {
                return Ok(ObjectHandle::Local(LocalObject::new(
                    service::SERVICE_DIRECTORY,
                    directory,
                    self.inner.context.clone(),
                )));
            }
        }
        let remote = self.inner.resolver.service(name, protocol).await?;
        Ok(ObjectHandle::Remote(remote))
    }

    /// Every ready service known to the directory.
    pub async fn services(&self) -> SessionResult<Vec<ServiceInfo>> {
        self.ensure_open()?;
        Ok(self.inner.directory.services().await?)
    }

    /// Urls the session serves its services on.
    pub fn endpoints(&self) -> Vec<Url> {
        self.inner.server.endpoints()
    }

    /// Url of the service directory: the remote one, or the first local
    /// endpoint when hosting it.
    pub fn url(&self) -> Option<Url> {
        if let Some(url) = self.inner.directory.url() {
            return Some(url);
        }
        if self.inner.local_directory.lock().is_none() {
            return None;
        }
        self.inner.server.endpoints().into_iter().next()
    }

    /// Machine this process runs on.
    pub fn machine_id(&self) -> &str {
        self.inner.context.machine_id()
    }

    /// Process identity shared by the session's components.
    pub fn context(&self) -> &Arc<ProcessContext> {
        &self.inner.context
    }

    /// True while a service directory is reachable.
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && self.inner.directory.is_connected()
    }

    /// Directory connection and registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceDirectoryEvent> {
        self.inner.directory.subscribe()
    }

    /// Client of the service directory this session uses.
    pub fn directory_client(&self) -> &ServiceDirectoryClient {
        &self.inner.directory
    }

    /// The object server.
    pub fn server(&self) -> &Server {
        &self.inner.server
    }

    /// Services registered by this session.
    pub fn registered_services(&self) -> Vec<ServiceInfo> {
        self.inner.registrar.registered_services()
    }

    /// Unregister every service, close every connection and stop serving.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Session::close");
        self.inner.shutdown.cancel();
        self.inner.resolver.close();
        self.inner.registrar.close().await;
        self.inner.server.close().await;
        self.inner.directory.close().await;
        self.inner.socket_cache.close().await;
        self.inner.local_directory.lock().take();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("machine_id", &self.machine_id())
            .field("connected", &self.is_connected())
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

fn advertise_directory(directory: &ServiceDirectory, endpoints: Vec<Url>) -> SessionResult<()> {
    let mut info = directory.service(SERVICE_DIRECTORY_NAME)?;
    info.endpoints = endpoints;
    directory.update_service_info(info)?;
    Ok(())
}

async fn track_directory_endpoints(
    directory: Weak<ServiceDirectory>,
    mut events: broadcast::Receiver<ServerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(ServerEvent::EndpointsChanged(endpoints)) => {
                let Some(directory) = directory.upgrade() else {
                    return;
                };
                if let Err(error) = advertise_directory(&directory, endpoints) {
                    tracing::warn!("Session could not advertise the directory: {}", error);
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
