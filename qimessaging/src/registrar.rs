//! Publishes local objects: registers them with the directory and serves them.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use qimessaging_core::is_internal_service;
use qimessaging_transport::{ProcessContext, ServerEvent, ServiceInfo, Url};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::directory::ServiceDirectoryClient;
use crate::error::{DirectoryError, RpcError, SessionError, SessionResult};
use crate::object::SharedObject;
use crate::server::Server;

struct Registered {
    info: ServiceInfo,
    object: SharedObject,
}

struct RegistrarInner {
    context: Arc<ProcessContext>,
    server: Server,
    directory: ServiceDirectoryClient,
    session_id: String,
    services: Mutex<BTreeMap<u32, Registered>>,
    shutdown: CancellationToken,
}

impl Drop for RegistrarInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl RegistrarInner {
    async fn update_endpoints(&self, endpoints: Vec<Url>) {
        let infos: Vec<ServiceInfo> = {
            let mut services = self.services.lock();
            services
                .values_mut()
                .map(|registered| {
                    registered.info.endpoints = endpoints.clone();
                    registered.info.clone()
                })
                .collect()
        };
        for info in infos {
            if let Err(error) = self.directory.update_service_info(&info).await {
                tracing::warn!(
                    "ObjectRegistrar::update_endpoints \"{}\" (#{}): {}",
                    info.name,
                    info.service_id,
                    error
                );
            }
        }
    }
}

/// Registers local services with the directory and serves them on the
/// object [`Server`].
///
/// Registration is two-phase: the directory assigns an id (pending), the
/// object is bound under that id, then the service is marked ready. When
/// the server's endpoints change every registered service is updated.
///
/// Cloning yields another handle on the same registrar.
#[derive(Clone)]
pub struct ObjectRegistrar {
    inner: Arc<RegistrarInner>,
}

impl ObjectRegistrar {
    /// Create a registrar publishing through `directory` and serving on `server`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        context: Arc<ProcessContext>,
        server: Server,
        directory: ServiceDirectoryClient,
    ) -> Self {
        let events = server.subscribe();
        let inner = Arc::new(RegistrarInner {
            session_id: context.new_session_id(),
            context,
            server,
            directory,
            services: Mutex::new(BTreeMap::new()),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(watch_endpoints(
            Arc::downgrade(&inner),
            events,
            inner.shutdown.clone(),
        ));
        Self { inner }
    }

    /// Session id stamped on every registered service.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Register `object` as `name` and return its service id.
    pub async fn register_service(&self, name: &str, object: SharedObject) -> SessionResult<u32> {
        if !self.inner.directory.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let endpoints = self.inner.server.endpoints();
        if endpoints.is_empty() {
            return Err(SessionError::NotListening);
        }
        let mut info = ServiceInfo {
            name: name.to_string(),
            service_id: 0,
            machine_id: self.inner.context.machine_id().to_string(),
            process_id: self.inner.context.process_id(),
            endpoints,
            session_id: self.inner.session_id.clone(),
        };

        let service_id = self.inner.directory.register_service(&info).await?;
        info.service_id = service_id;
        if !self.inner.server.add_object(service_id, object.clone()) {
            let _ = self.inner.directory.unregister_service(service_id).await;
            return Err(RpcError::Failed(format!("service #{service_id} is already served")).into());
        }
        self.inner.services.lock().insert(
            service_id,
            Registered {
                info: info.clone(),
                object,
            },
        );

        if let Err(error) = self.inner.directory.service_ready(service_id).await {
            tracing::warn!(
                "ObjectRegistrar::register_service \"{}\" (#{}) not ready: {}",
                name,
                service_id,
                error
            );
            self.inner.services.lock().remove(&service_id);
            self.inner.server.remove_object(service_id);
            let _ = self.inner.directory.unregister_service(service_id).await;
            return Err(error.into());
        }

        if is_internal_service(name) {
            tracing::debug!("ObjectRegistrar registered \"{}\" (#{})", name, service_id);
        } else {
            tracing::info!("ObjectRegistrar registered \"{}\" (#{})", name, service_id);
        }
        Ok(service_id)
    }

    /// Unregister a service registered through this registrar.
    pub async fn unregister_service(&self, service_id: u32) -> SessionResult<()> {
        if !self.inner.services.lock().contains_key(&service_id) {
            return Err(DirectoryError::CannotUnregister(service_id).into());
        }
        let result = self.inner.directory.unregister_service(service_id).await;
        self.inner.services.lock().remove(&service_id);
        self.inner.server.remove_object(service_id);
        result.map_err(Into::into)
    }

    /// The local object registered as `name`.
    pub fn registered_object(&self, name: &str) -> Option<(u32, SharedObject)> {
        self.inner
            .services
            .lock()
            .iter()
            .find(|(_, registered)| registered.info.name == name)
            .map(|(id, registered)| (*id, registered.object.clone()))
    }

    /// Descriptions of the services registered through this registrar.
    pub fn registered_services(&self) -> Vec<ServiceInfo> {
        self.inner
            .services
            .lock()
            .values()
            .map(|registered| registered.info.clone())
            .collect()
    }

    /// Re-advertise every registered service with `endpoints`.
    pub async fn update_endpoints(&self, endpoints: Vec<Url>) {
        self.inner.update_endpoints(endpoints).await;
    }

    /// Unregister every service, best effort.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let ids: Vec<u32> = self.inner.services.lock().keys().copied().collect();
        for service_id in ids {
            if self.inner.directory.is_connected() {
                if let Err(error) = self.inner.directory.unregister_service(service_id).await {
                    tracing::debug!("ObjectRegistrar::close #{}: {}", service_id, error);
                }
            }
            self.inner.server.remove_object(service_id);
        }
        self.inner.services.lock().clear();
    }
}

async fn watch_endpoints(
    inner: Weak<RegistrarInner>,
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
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.update_endpoints(endpoints).await;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

impl std::fmt::Debug for ObjectRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistrar")
            .field("services", &self.inner.services.lock().len())
            .finish()
    }
}
