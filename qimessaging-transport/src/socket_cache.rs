//! TransportSocketCache: one connection per remote machine.
//!
//! [`socket`](TransportSocketCache::socket) turns the endpoints advertised by
//! a service into a connected socket. Every candidate endpoint is connected
//! concurrently and all of them share one result:
//!
//! - the first successful connect fulfils it, later winners are disconnected
//! - the last failure fails it with [`SocketCacheError::NoEndpointReplied`]
//! - a lookup overlapping an attempt (same machine, one common url) gets the
//!   same shared future, so concurrent lookups end up on the same socket
//!
//! Entries are forgotten when their socket disconnects, so the next lookup
//! reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};

use qimessaging_core::{ProcessContext, Protocol, ServiceInfo, Url};

use crate::socket::{SharedSocket, SocketConfig, SocketEvent, SocketId, make_message_socket};

/// Errors reported through [`SocketFuture`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketCacheError {
    /// The cache was closed before or during the lookup.
    #[error("TransportSocketCache is closing.")]
    Closing,

    /// No endpoint is left once endpoints are filtered.
    #[error("No endpoint available for service #{service_id}.")]
    NoEndpoint {
        /// Service being looked up
        service_id: u32,
    },

    /// Every candidate endpoint failed.
    #[error("Could not connect to service #{service_id}: no endpoint replied.")]
    NoEndpointReplied {
        /// Service being looked up
        service_id: u32,
    },
}

/// Shared result of a connection attempt; clone it to wait from several places.
pub type SocketFuture = Shared<BoxFuture<'static, Result<SharedSocket, SocketCacheError>>>;

type AttemptId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptState {
    Pending,
    Connected,
    Error,
}

struct Attempt {
    state: AttemptState,
    /// Racers that have not reported yet.
    remaining: usize,
    promise: Option<oneshot::Sender<Result<SharedSocket, SocketCacheError>>>,
    future: SocketFuture,
    socket: Option<SharedSocket>,
    related_urls: Vec<Url>,
}

impl Attempt {
    fn new(related_urls: Vec<Url>, remaining: usize) -> Self {
        let (promise, receiver) = oneshot::channel();
        let future = receiver
            .map(|result| result.unwrap_or(Err(SocketCacheError::Closing)))
            .boxed()
            .shared();
        Self {
            state: AttemptState::Pending,
            remaining,
            promise: Some(promise),
            future,
            socket: None,
            related_urls,
        }
    }

    fn complete(&mut self, result: Result<SharedSocket, SocketCacheError>) {
        if let Some(promise) = self.promise.take() {
            let _ = promise.send(result);
        }
    }
}

#[derive(Default)]
struct CacheState {
    dying: bool,
    next_attempt: AttemptId,
    attempts: HashMap<AttemptId, Attempt>,
    /// machine id -> url -> attempt
    connections: HashMap<String, HashMap<Url, AttemptId>>,
    /// Sockets still connecting, disconnected on close.
    pending: HashMap<SocketId, SharedSocket>,
}

impl CacheState {
    fn attempt_for(&self, machine_id: &str, url: &Url) -> Option<AttemptId> {
        self.connections.get(machine_id)?.get(url).copied()
    }

    /// Forget an attempt that can no longer produce a socket.
    fn check_clear(&mut self, attempt_id: AttemptId, machine_id: &str) {
        let Some(attempt) = self.attempts.get(&attempt_id) else {
            return;
        };
        let finished = (attempt.remaining == 0 && attempt.state != AttemptState::Connected)
            || attempt.state == AttemptState::Error;
        if !finished {
            return;
        }
        let related = attempt.related_urls.clone();
        self.attempts.remove(&attempt_id);
        if let Some(urls) = self.connections.get_mut(machine_id) {
            for url in &related {
                if urls.get(url) == Some(&attempt_id) {
                    urls.remove(url);
                }
            }
            if urls.is_empty() {
                self.connections.remove(machine_id);
            }
        }
    }
}

struct CacheInner {
    context: Arc<ProcessContext>,
    config: SocketConfig,
    state: Mutex<CacheState>,
}

/// Cache of outgoing connections, keyed by machine id and url.
///
/// Cloning yields another handle on the same cache.
#[derive(Clone)]
pub struct TransportSocketCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for TransportSocketCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TransportSocketCache")
            .field("machines", &state.connections.len())
            .field("attempts", &state.attempts.len())
            .field("dying", &state.dying)
            .finish()
    }
}

/// Endpoints worth trying to reach a service.
///
/// On the same machine only loopback urls are used, unless the service
/// advertises none. Remote loopback urls are never tried.
pub fn filter_endpoints(info: &ServiceInfo, local_machine_id: &str, protocol: Option<Protocol>) -> Vec<Url> {
    let local = info.machine_id == local_machine_id;
    let wanted = |url: &&Url| protocol.map_or(true, |p| url.protocol() == p);

    let mut candidates: Vec<Url> = if local {
        info.endpoints
            .iter()
            .filter(|url| url.is_loopback())
            .filter(wanted)
            .cloned()
            .collect()
    } else {
        Vec::new()
    };
    if candidates.is_empty() {
        candidates = info
            .endpoints
            .iter()
            .filter(wanted)
            .filter(|url| local || !url.is_loopback())
            .cloned()
            .collect();
    }
    candidates
}

impl TransportSocketCache {
    /// Create an empty cache.
    pub fn new(context: Arc<ProcessContext>, config: SocketConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                context,
                config,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Get a connected socket to the machine hosting `info`.
    ///
    /// `protocol` restricts the endpoints tried. Must be called within a
    /// tokio runtime: connection attempts run on spawned tasks.
    pub fn socket(&self, info: &ServiceInfo, protocol: Option<Protocol>) -> SocketFuture {
        let candidates = filter_endpoints(info, self.inner.context.machine_id(), protocol);
        if candidates.is_empty() {
            tracing::warn!(
                "TransportSocketCache::socket no endpoint left for service #{} after filtering",
                info.service_id
            );
        }

        let mut state = self.inner.state.lock();
        if state.dying {
            return ready(Err(SocketCacheError::Closing));
        }

        // A pending or established connection to one of the urls serves us too.
        if let Some(urls) = state.connections.get(&info.machine_id) {
            for url in &info.endpoints {
                if let Some(attempt) = urls.get(url).and_then(|id| state.attempts.get(id)) {
                    if attempt.state != AttemptState::Error {
                        tracing::debug!(
                            "TransportSocketCache::socket reusing attempt for {} on {}",
                            info.machine_id,
                            url
                        );
                        return attempt.future.clone();
                    }
                }
            }
        }

        if candidates.is_empty() {
            return ready(Err(SocketCacheError::NoEndpoint {
                service_id: info.service_id,
            }));
        }

        let attempt_id = state.next_attempt;
        state.next_attempt += 1;
        let attempt = Attempt::new(info.endpoints.clone(), candidates.len());
        let future = attempt.future.clone();
        state.attempts.insert(attempt_id, attempt);

        for url in candidates {
            state
                .connections
                .entry(info.machine_id.clone())
                .or_default()
                .insert(url.clone(), attempt_id);
            let socket = make_message_socket(&url, self.inner.config.clone());
            state.pending.insert(socket.id(), socket.clone());
            tracing::debug!(
                "TransportSocketCache::socket attempting {} for machine {}",
                url,
                info.machine_id
            );

            let cache = Arc::downgrade(&self.inner);
            let info = info.clone();
            tokio::spawn(async move {
                let result = socket.connect(&url).await;
                on_connect_attempt(cache, attempt_id, url, socket, result.is_ok(), info).await;
            });
        }
        future
    }

    /// Register an already connected socket, for instance an accepted one.
    ///
    /// A pending attempt on the same machine and url is fulfilled with it.
    pub fn insert(&self, machine_id: &str, url: &Url, socket: SharedSocket) {
        {
            let mut state = self.inner.state.lock();
            if state.dying {
                return;
            }
            match state.attempt_for(machine_id, url) {
                Some(attempt_id) => {
                    if let Some(attempt) = state.attempts.get_mut(&attempt_id) {
                        if attempt.state != AttemptState::Pending {
                            // A finished attempt keeps its result; start a fresh one.
                            let related = attempt.related_urls.clone();
                            *attempt = Attempt::new(related, 0);
                        }
                        attempt.state = AttemptState::Connected;
                        attempt.socket = Some(socket.clone());
                        attempt.complete(Ok(socket.clone()));
                    }
                }
                None => {
                    let attempt_id = state.next_attempt;
                    state.next_attempt += 1;
                    let mut attempt = Attempt::new(vec![url.clone()], 0);
                    attempt.state = AttemptState::Connected;
                    attempt.socket = Some(socket.clone());
                    attempt.complete(Ok(socket.clone()));
                    state.attempts.insert(attempt_id, attempt);
                    state
                        .connections
                        .entry(machine_id.to_string())
                        .or_default()
                        .insert(url.clone(), attempt_id);
                }
            }
        }
        track_disconnection(&self.inner, machine_id.to_string(), url.clone(), socket);
    }

    /// Disconnect `socket` and forget it.
    pub async fn disconnect(&self, socket: &SharedSocket) {
        socket.disconnect().await;
        forget_socket(&self.inner, socket.id());
    }

    /// Number of machines with a pending or established connection.
    pub fn machine_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Fail pending lookups and disconnect every socket.
    ///
    /// Later lookups fail with [`SocketCacheError::Closing`].
    pub async fn close(&self) {
        tracing::debug!("TransportSocketCache is closing");
        let (attempts, pending) = {
            let mut state = self.inner.state.lock();
            state.dying = true;
            state.connections.clear();
            let attempts: Vec<Attempt> = state.attempts.drain().map(|(_, a)| a).collect();
            let pending: Vec<SharedSocket> = state.pending.drain().map(|(_, s)| s).collect();
            (attempts, pending)
        };

        let mut sockets = pending;
        for mut attempt in attempts {
            match attempt.socket.take() {
                Some(socket) => sockets.push(socket),
                None => attempt.complete(Err(SocketCacheError::Closing)),
            }
        }
        futures::future::join_all(sockets.iter().map(|socket| socket.disconnect())).await;
    }

    /// Reopen a closed cache.
    pub fn init(&self) {
        self.inner.state.lock().dying = false;
    }
}

fn ready(result: Result<SharedSocket, SocketCacheError>) -> SocketFuture {
    futures::future::ready(result).boxed().shared()
}

async fn on_connect_attempt(
    cache: Weak<CacheInner>,
    attempt_id: AttemptId,
    url: Url,
    socket: SharedSocket,
    connected: bool,
    info: ServiceInfo,
) {
    let Some(inner) = cache.upgrade() else {
        if connected {
            socket.disconnect().await;
        }
        return;
    };

    let reject = {
        let mut state = inner.state.lock();
        state.pending.remove(&socket.id());

        if state.dying {
            tracing::debug!("on_connect_attempt: cache is closing");
            connected
        } else if state.attempt_for(&info.machine_id, &url) != Some(attempt_id) {
            // The entry went away meanwhile (socket disconnected or replaced).
            connected
        } else {
            let (reject, clear) = match state.attempts.get_mut(&attempt_id) {
                None => (connected, false),
                Some(attempt) => {
                    attempt.remaining = attempt.remaining.saturating_sub(1);
                    if attempt.state != AttemptState::Pending {
                        tracing::debug!("on_connect_attempt: already connected, rejecting {}", url);
                        (connected, true)
                    } else if !connected {
                        tracing::debug!(
                            "on_connect_attempt: could not connect to service #{} through {}",
                            info.service_id,
                            url
                        );
                        let exhausted = attempt.remaining == 0;
                        if exhausted {
                            let error = SocketCacheError::NoEndpointReplied {
                                service_id: info.service_id,
                            };
                            tracing::error!("{}", error);
                            attempt.state = AttemptState::Error;
                            attempt.complete(Err(error));
                        }
                        (false, exhausted)
                    } else {
                        attempt.state = AttemptState::Connected;
                        attempt.socket = Some(socket.clone());
                        attempt.complete(Ok(socket.clone()));
                        tracing::debug!(
                            "on_connect_attempt: connected to service #{} through {}",
                            info.service_id,
                            url
                        );
                        (false, false)
                    }
                }
            };
            if clear {
                state.check_clear(attempt_id, &info.machine_id);
            }
            reject
        }
    };

    if reject {
        socket.disconnect().await;
    } else if connected {
        track_disconnection(&inner, info.machine_id, url, socket);
    }
}

/// Drop the cache entry of `socket` once it disconnects.
fn track_disconnection(inner: &Arc<CacheInner>, machine_id: String, url: Url, socket: SharedSocket) {
    let mut events = socket.subscribe();
    let cache = Arc::downgrade(inner);
    let socket_id = socket.id();
    // The socket may have died before the subscription.
    let already_gone = !socket.is_connected();
    drop(socket);
    tokio::spawn(async move {
        if !already_gone {
            loop {
                match events.recv().await {
                    Ok(SocketEvent::Disconnected { .. }) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        if let Some(inner) = cache.upgrade() {
            tracing::debug!("TransportSocketCache: {} on {} disconnected", socket_id, url);
            let mut state = inner.state.lock();
            if let Some(attempt_id) = state.attempt_for(&machine_id, &url) {
                let ours = state
                    .attempts
                    .get(&attempt_id)
                    .and_then(|a| a.socket.as_ref())
                    .is_some_and(|s| s.id() == socket_id);
                if ours {
                    if let Some(attempt) = state.attempts.get_mut(&attempt_id) {
                        attempt.state = AttemptState::Error;
                    }
                    state.check_clear(attempt_id, &machine_id);
                }
            }
        }
    });
}

fn forget_socket(inner: &Arc<CacheInner>, socket_id: SocketId) {
    let mut state = inner.state.lock();
    let owned: Vec<(AttemptId, String)> = state
        .connections
        .iter()
        .flat_map(|(machine, urls)| urls.values().map(move |id| (*id, machine.clone())))
        .filter(|(id, _)| {
            state
                .attempts
                .get(id)
                .and_then(|a| a.socket.as_ref())
                .is_some_and(|s| s.id() == socket_id)
        })
        .collect();
    for (attempt_id, machine) in owned {
        if let Some(attempt) = state.attempts.get_mut(&attempt_id) {
            attempt.state = AttemptState::Error;
        }
        state.check_clear(attempt_id, &machine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(machine_id: &str, endpoints: &[&str]) -> ServiceInfo {
        ServiceInfo {
            name: "echo".to_string(),
            service_id: 2,
            machine_id: machine_id.to_string(),
            endpoints: endpoints
                .iter()
                .map(|e| Url::parse(e).expect("url"))
                .collect(),
            ..ServiceInfo::default()
        }
    }

    #[test]
    fn test_local_service_prefers_loopback() {
        let service = info("me", &["tcp://10.0.0.5:9559", "tcp://127.0.0.1:9559"]);
        let candidates = filter_endpoints(&service, "me", None);
        assert_eq!(candidates, vec![Url::parse("tcp://127.0.0.1:9559").expect("url")]);
    }

    #[test]
    fn test_local_service_without_loopback_uses_anything() {
        let service = info("me", &["tcp://10.0.0.5:9559"]);
        assert_eq!(filter_endpoints(&service, "me", None).len(), 1);
    }

    #[test]
    fn test_remote_service_skips_loopback() {
        let service = info("other", &["tcp://127.0.0.1:9559", "tcp://10.0.0.5:9559", "tcps://10.0.0.5:9560"]);
        let candidates = filter_endpoints(&service, "me", None);
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|url| !url.is_loopback()));

        let tls_only = filter_endpoints(&service, "me", Some(Protocol::Tcps));
        assert_eq!(tls_only, vec![Url::parse("tcps://10.0.0.5:9560").expect("url")]);
    }

    #[tokio::test]
    async fn test_closed_cache_fails_at_once() {
        let cache = TransportSocketCache::new(
            ProcessContext::with_machine_id("me"),
            SocketConfig::local_network(),
        );
        cache.close().await;
        let result = cache
            .socket(&info("me", &["tcp://127.0.0.1:1"]), None)
            .await;
        assert_eq!(result.err(), Some(SocketCacheError::Closing));
    }

    #[tokio::test]
    async fn test_no_endpoint_fails() {
        let cache = TransportSocketCache::new(
            ProcessContext::with_machine_id("me"),
            SocketConfig::local_network(),
        );
        let result = cache.socket(&info("other", &["tcp://127.0.0.1:1"]), None).await;
        assert_eq!(result.err(), Some(SocketCacheError::NoEndpoint { service_id: 2 }));
    }
}
