//! Turns service names into connected [`RemoteObject`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use qimessaging_transport::message::object;
use qimessaging_transport::{Protocol, TransportSocketCache};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::directory::{ServiceDirectoryClient, ServiceDirectoryEvent};
use crate::error::{SessionError, SessionResult};
use crate::object::RemoteObject;

/// Identifies one in-flight resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

type Resolution = Shared<BoxFuture<'static, SessionResult<RemoteObject>>>;

struct PendingRequest {
    name: String,
    protocol: Option<Protocol>,
    // Weak so that the resolution ends once every waiter is gone.
    resolution: WeakShared<BoxFuture<'static, SessionResult<RemoteObject>>>,
    started: u64,
}

/// Forgets a request once no waiter holds its resolution any more.
struct WaiterGuard<'a> {
    inner: &'a ResolverInner,
    request: RequestId,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut requests = self.inner.requests.lock();
        let abandoned = requests
            .get(&self.request)
            .is_some_and(|pending| pending.resolution.upgrade().is_none());
        if abandoned {
            tracing::debug!("ServiceResolver {} abandoned", self.request);
            requests.remove(&self.request);
        }
    }
}

struct ResolverInner {
    directory: ServiceDirectoryClient,
    cache: TransportSocketCache,
    remote_objects: Mutex<HashMap<String, RemoteObject>>,
    requests: Mutex<BTreeMap<RequestId, PendingRequest>>,
    next_request: AtomicU64,
    // Bumped on every eviction; `removed` keeps the value per name.
    generation: AtomicU64,
    removed: Mutex<HashMap<String, u64>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Drop for ResolverInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl ResolverInner {
    fn evict(&self, name: &str) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.removed.lock().insert(name.to_string(), generation);
        if let Some(remote) = self.remote_objects.lock().remove(name) {
            tracing::debug!("ServiceResolver evicting \"{}\"", name);
            remote.close();
        }
    }
}

/// Resolves service names to proxies.
///
/// For each name:
/// 1. a cached, still connected proxy is returned directly;
/// 2. otherwise the directory is asked for the service's [`ServiceInfo`](qimessaging_transport::ServiceInfo);
/// 3. the socket cache provides a connection to one of its endpoints;
/// 4. the object's meta object is fetched over that connection.
///
/// Concurrent lookups of the same name share one resolution. When two
/// resolutions of a name race, the first one cached wins and later callers
/// get it too. A `serviceRemoved` notification evicts the name; a resolution
/// that started before the removal is discarded and retried. A resolution
/// whose callers all gave up is dropped with them.
///
/// Cloning yields another handle on the same resolver.
#[derive(Clone)]
pub struct ServiceResolver {
    inner: Arc<ResolverInner>,
}

impl ServiceResolver {
    /// Create a resolver using `directory` for lookups and `cache` for connections.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(directory: ServiceDirectoryClient, cache: TransportSocketCache) -> Self {
        let events = directory.subscribe();
        let inner = Arc::new(ResolverInner {
            directory,
            cache,
            remote_objects: Mutex::new(HashMap::new()),
            requests: Mutex::new(BTreeMap::new()),
            next_request: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            removed: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(watch_directory(
            Arc::downgrade(&inner),
            events,
            inner.shutdown.clone(),
        ));
        Self { inner }
    }

    /// Proxy for the service called `name`, reached over `protocol` when given.
    pub async fn service(&self, name: &str, protocol: Option<Protocol>) -> SessionResult<RemoteObject> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(SessionError::Closed);
            }
            if let Some(remote) = self.cached(name) {
                return Ok(remote);
            }

            let (request, resolution, started) = self.join_or_start(name, protocol);
            let _guard = WaiterGuard {
                inner: &*self.inner,
                request,
            };
            // Dropped before the guard, also when the caller gives up.
            let result = {
                let resolution = resolution;
                resolution.await
            };
            self.inner.requests.lock().remove(&request);
            let remote = match result {
                Ok(remote) => remote,
                Err(error) => {
                    tracing::debug!("ServiceResolver {} \"{}\" failed: {}", request, name, error);
                    return Err(error);
                }
            };
            if self.inner.closed.load(Ordering::Acquire) {
                remote.close();
                return Err(SessionError::Closed);
            }

            let cached = {
                let mut remote_objects = self.inner.remote_objects.lock();
                let removed = self.inner.removed.lock().get(name).copied();
                if removed.is_some_and(|generation| generation > started) {
                    None
                } else {
                    Some(match remote_objects.get(name) {
                        Some(existing) if existing.is_connected() => existing.clone(),
                        _ => {
                            remote_objects.insert(name.to_string(), remote.clone());
                            remote.clone()
                        }
                    })
                }
            };
            match cached {
                Some(cached) => return Ok(cached),
                None => {
                    tracing::debug!("ServiceResolver {} \"{}\" was removed meanwhile", request, name);
                    remote.close();
                }
            }
        }
    }

    fn join_or_start(&self, name: &str, protocol: Option<Protocol>) -> (RequestId, Resolution, u64) {
        let mut requests = self.inner.requests.lock();
        requests.retain(|_, pending| pending.resolution.upgrade().is_some());
        let existing = requests
            .iter()
            .filter(|(_, pending)| pending.name == name && pending.protocol == protocol)
            .find_map(|(id, pending)| {
                let resolution = pending.resolution.upgrade()?;
                Some((*id, resolution, pending.started))
            });
        if let Some(found) = existing {
            return found;
        }

        let id = RequestId(self.inner.next_request.fetch_add(1, Ordering::Relaxed));
        let started = self.inner.generation.load(Ordering::Acquire);
        let resolution = resolve(
            self.inner.directory.clone(),
            self.inner.cache.clone(),
            name.to_string(),
            protocol,
        )
        .boxed()
        .shared();
        let Some(weak) = resolution.downgrade() else {
            // Only fails for a completed future; this one was never polled.
            return (id, resolution, started);
        };
        requests.insert(
            id,
            PendingRequest {
                name: name.to_string(),
                protocol,
                resolution: weak,
                started,
            },
        );
        tracing::debug!("ServiceResolver {} resolves \"{}\"", id, name);
        (id, resolution, started)
    }

    fn cached(&self, name: &str) -> Option<RemoteObject> {
        let mut remote_objects = self.inner.remote_objects.lock();
        let remote = remote_objects.get(name)?;
        if remote.is_connected() {
            return Some(remote.clone());
        }
        if let Some(stale) = remote_objects.remove(name) {
            stale.close();
        }
        None
    }

    /// Number of cached proxies.
    pub fn cached_count(&self) -> usize {
        self.inner.remote_objects.lock().len()
    }

    /// Number of resolutions in flight.
    pub fn pending_count(&self) -> usize {
        self.inner
            .requests
            .lock()
            .values()
            .filter(|pending| pending.resolution.upgrade().is_some())
            .count()
    }

    /// Drop a cached proxy.
    pub fn remove_service(&self, name: &str) {
        self.inner.evict(name);
    }

    /// Close every cached proxy and refuse further lookups.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.shutdown.cancel();
        self.inner.requests.lock().clear();
        let remotes: Vec<RemoteObject> = self
            .inner
            .remote_objects
            .lock()
            .drain()
            .map(|(_, remote)| remote)
            .collect();
        for remote in remotes {
            remote.close();
        }
    }
}

async fn resolve(
    directory: ServiceDirectoryClient,
    cache: TransportSocketCache,
    name: String,
    protocol: Option<Protocol>,
) -> SessionResult<RemoteObject> {
    let info = directory.service(&name).await?;
    let socket = cache.socket(&info, protocol).await?;
    let remote = RemoteObject::new(socket, info.service_id, object::MAIN);
    remote.fetch_meta_object().await?;
    tracing::debug!(
        "ServiceResolver resolved \"{}\" (#{}) through {:?}",
        name,
        info.service_id,
        remote.socket().remote_url().map(|url| url.to_string())
    );
    Ok(remote)
}

async fn watch_directory(
    inner: Weak<ResolverInner>,
    mut events: broadcast::Receiver<ServiceDirectoryEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(ServiceDirectoryEvent::ServiceRemoved(_, name)) => match inner.upgrade() {
                Some(inner) => inner.evict(&name),
                None => return,
            },
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

impl std::fmt::Debug for ServiceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceResolver")
            .field("cached", &self.cached_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use qimessaging_transport::{
        Buffer, ProcessContext, ServiceInfo, SharedSocket, SocketConfig, TransportServer, Url,
    };
    use tokio::sync::mpsc;

    use crate::directory::ServiceDirectory;
    use crate::error::RpcError;
    use crate::object::{CallContext, MetaObject, ServiceObject};
    use crate::server::Server;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Echo;

    #[async_trait]
    impl ServiceObject for Echo {
        fn meta_object(&self) -> MetaObject {
            MetaObject::new().with_method(100, "reply", "(s)", "s")
        }

        async fn call(&self, _ctx: &CallContext, _action: u32, args: Buffer) -> Result<Buffer, RpcError> {
            Ok(args)
        }
    }

    fn resolver() -> ServiceResolver {
        let directory = ServiceDirectoryClient::new(SocketConfig::local_network());
        let cache = TransportSocketCache::new(
            ProcessContext::with_machine_id("machine-a"),
            SocketConfig::local_network(),
        );
        ServiceResolver::new(directory, cache)
    }

    /// A resolver over a local directory where "echo" points at a listener
    /// whose sockets stay unread until handed to `server`.
    struct Fixture {
        resolver: ServiceResolver,
        directory: Arc<ServiceDirectory>,
        incoming: mpsc::UnboundedReceiver<SharedSocket>,
        server: Server,
        _listener: TransportServer,
    }

    async fn fixture() -> Fixture {
        let context = ProcessContext::with_machine_id("machine-a");
        let listener = TransportServer::new(SocketConfig::local_network());
        let incoming = listener.new_connections().expect("receiver");
        let endpoints = listener
            .listen(&Url::parse("tcp://127.0.0.1:0").expect("url"))
            .await
            .expect("listen");

        let directory = ServiceDirectory::new(context.clone());
        let client = ServiceDirectoryClient::new(SocketConfig::local_network());
        client
            .set_service_directory(directory.clone())
            .expect("local directory");
        let mut info = ServiceInfo::new("echo");
        info.machine_id = "machine-a".to_string();
        info.endpoints = endpoints;
        let id = directory.register_service(info, None).expect("register");
        directory.service_ready(id).expect("ready");

        let server = Server::new(context.clone(), SocketConfig::local_network());
        assert!(server.add_object(id, Arc::new(Echo)));
        let cache = TransportSocketCache::new(context, SocketConfig::local_network());
        Fixture {
            resolver: ServiceResolver::new(client, cache),
            directory,
            incoming,
            server,
            _listener: listener,
        }
    }

    impl Fixture {
        async fn serve_next_socket(&mut self) {
            let socket = tokio::time::timeout(TIMEOUT, self.incoming.recv())
                .await
                .expect("accepted in time")
                .expect("accepted");
            self.server.add_incoming_socket(socket);
        }
    }

    #[tokio::test]
    async fn test_lookup_without_directory_fails() {
        let resolver = resolver();
        let result = resolver.service("echo", None).await;
        assert_eq!(
            result.err(),
            Some(SessionError::Rpc(crate::error::RpcError::NotConnected))
        );
        assert_eq!(resolver.pending_count(), 0);
        assert_eq!(resolver.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_resolver_refuses_lookups() {
        let resolver = resolver();
        resolver.close();
        assert_eq!(
            resolver.service("echo", None).await.err(),
            Some(SessionError::Closed)
        );
    }

    #[tokio::test]
    async fn test_abandoned_lookup_is_forgotten() {
        let mut fixture = fixture().await;

        let first = fixture.resolver.service("echo", None).now_or_never();
        assert!(first.is_none(), "resolution should still be waiting");
        assert_eq!(fixture.resolver.pending_count(), 0);

        // A later lookup starts over and completes.
        let resolver = fixture.resolver.clone();
        let lookup = tokio::spawn(async move { resolver.service("echo", None).await });
        fixture.serve_next_socket().await;
        let remote = tokio::time::timeout(TIMEOUT, lookup)
            .await
            .expect("resolved in time")
            .expect("join")
            .expect("resolved");
        assert_eq!(remote.service_id(), 2);
        assert_eq!(fixture.resolver.pending_count(), 0);
        assert_eq!(fixture.resolver.cached_count(), 1);
    }

    #[tokio::test]
    async fn test_removal_during_lookup_is_not_cached() {
        let mut fixture = fixture().await;

        let resolver = fixture.resolver.clone();
        let lookup = tokio::spawn(async move { resolver.service("echo", None).await });
        let socket = tokio::time::timeout(TIMEOUT, fixture.incoming.recv())
            .await
            .expect("accepted in time")
            .expect("accepted");
        assert_eq!(fixture.resolver.pending_count(), 1);

        // The service goes away while its meta object is still in flight.
        fixture.directory.unregister_service(2).expect("unregister");
        fixture.resolver.remove_service("echo");
        fixture.server.add_incoming_socket(socket);

        let result = tokio::time::timeout(TIMEOUT, lookup)
            .await
            .expect("finished in time")
            .expect("join");
        assert_eq!(
            result.err(),
            Some(SessionError::Rpc(RpcError::Remote(
                "Cannot find service 'echo' in index".to_string()
            )))
        );
        assert_eq!(fixture.resolver.cached_count(), 0);
        assert_eq!(fixture.resolver.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_service_removed_evicts_the_proxy() {
        let mut fixture = fixture().await;

        let resolver = fixture.resolver.clone();
        let lookup = tokio::spawn(async move { resolver.service("echo", None).await });
        fixture.serve_next_socket().await;
        let remote = tokio::time::timeout(TIMEOUT, lookup)
            .await
            .expect("resolved in time")
            .expect("join")
            .expect("resolved");
        assert_eq!(fixture.resolver.cached_count(), 1);

        fixture.directory.unregister_service(2).expect("unregister");
        tokio::time::timeout(TIMEOUT, async {
            while fixture.resolver.cached_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("evicted in time");
        assert_eq!(
            remote.call(100, Buffer::new()).await,
            Err(RpcError::Closed)
        );

        let again = fixture.resolver.service("echo", None).await;
        assert_eq!(
            again.err(),
            Some(SessionError::Rpc(RpcError::Remote(
                "Cannot find service 'echo' in index".to_string()
            )))
        );
    }
}
