//! TransportServer: listening endpoints producing accepted sockets.
//!
//! Each [`listen`](TransportServer::listen) call binds one endpoint and
//! spawns an accept loop for it. Accepted connections are wrapped in a
//! [`TcpMessageSocket`] (after the TLS handshake for `tcps`) and handed over
//! on the channel returned by [`new_connections`](TransportServer::new_connections).
//! They do not read until the owner calls `start_reading()`.
//!
//! The server keeps the list of urls at which it can be reached. For an
//! endpoint bound to an unspecified address (`0.0.0.0`) that list is
//! recomputed periodically and [`ServerEvent::EndpointsChanged`] is emitted
//! whenever it changes.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use qimessaging_core::{Protocol, Url};

use crate::socket::{BoxedStream, SharedSocket, SocketConfig, SocketError, TcpMessageSocket, tls};

/// Errors returned by [`TransportServer::listen`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// The server was closed.
    #[error("TransportServer is closed")]
    Closed,

    /// The listen host could not be resolved.
    #[error("Cannot resolve listen url {url}: {reason}")]
    Resolve {
        /// Requested url
        url: String,
        /// Resolver message
        reason: String,
    },

    /// The listen host only resolves to IPv6 and IPv6 is disabled.
    #[error("Listen url {url} is IPv6 only and IPv6 is disabled")]
    Ipv6Disabled {
        /// Requested url
        url: String,
    },

    /// Binding the socket failed.
    #[error("Cannot listen on {url}: {reason}")]
    Bind {
        /// Requested url
        url: String,
        /// Operating system message
        reason: String,
    },

    /// A `tcps` endpoint was requested without certificate material.
    #[error("Cannot listen on {url}: no TLS certificate configured")]
    MissingCertificate {
        /// Requested url
        url: String,
    },

    /// TLS setup failed.
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Notifications emitted by a [`TransportServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The list of reachable urls changed.
    EndpointsChanged(Vec<Url>),
}

/// Configuration of a [`TransportServer`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Configuration given to accepted sockets
    pub socket: SocketConfig,

    /// Extra host names or addresses reported for unspecified binds
    pub advertised_hosts: Vec<String>,

    /// How often endpoints of unspecified binds are recomputed
    pub endpoint_refresh_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            advertised_hosts: Vec::new(),
            endpoint_refresh_interval: Duration::from_secs(5),
        }
    }
}

impl From<SocketConfig> for ServerConfig {
    fn from(socket: SocketConfig) -> Self {
        Self {
            socket,
            ..Self::default()
        }
    }
}

/// One bound endpoint.
#[derive(Debug, Clone)]
struct Listening {
    requested: Url,
    bound: SocketAddr,
}

#[derive(Default)]
struct ServerState {
    listening: Vec<Listening>,
    endpoints: Vec<Url>,
    refreshing: bool,
}

struct ServerInner {
    config: ServerConfig,
    state: Mutex<ServerState>,
    connections: mpsc::UnboundedSender<SharedSocket>,
    connections_rx: Mutex<Option<mpsc::UnboundedReceiver<SharedSocket>>>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Accepts connections on any number of endpoints.
pub struct TransportServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("endpoints", &self.endpoints())
            .field("closed", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl TransportServer {
    /// Create a server that is not listening yet.
    pub fn new(config: impl Into<ServerConfig>) -> Self {
        let (connections, connections_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(ServerInner {
                config: config.into(),
                state: Mutex::new(ServerState::default()),
                connections,
                connections_rx: Mutex::new(Some(connections_rx)),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Take the receiver of accepted sockets. Returns `None` after the first call.
    pub fn new_connections(&self) -> Option<mpsc::UnboundedReceiver<SharedSocket>> {
        self.inner.connections_rx.lock().take()
    }

    /// Subscribe to endpoint changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Bind `url` and start accepting on it.
    ///
    /// Port 0 picks an ephemeral port. Returns the urls at which the new
    /// endpoint is reachable.
    pub async fn listen(&self, url: &Url) -> Result<Vec<Url>, ServerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ServerError::Closed);
        }
        let socket_config = &self.inner.config.socket;

        let acceptor = if url.protocol().is_tls() {
            let tls = socket_config
                .tls
                .as_ref()
                .ok_or_else(|| ServerError::MissingCertificate {
                    url: url.to_string(),
                })?;
            Some(tls.acceptor()?)
        } else {
            None
        };

        let address = resolve_listen_address(url, socket_config.ipv6_enabled).await?;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ServerError::Bind {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let bound = listener.local_addr().map_err(|e| ServerError::Bind {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let listening = Listening {
            requested: url.clone(),
            bound,
        };
        let reachable = listening_endpoints(&listening, &self.inner.config.advertised_hosts);
        for endpoint in &reachable {
            tracing::info!("TransportServer will listen on: {}", endpoint);
        }

        tokio::spawn(accept_loop(
            listener,
            url.protocol(),
            acceptor,
            socket_config.clone(),
            self.inner.connections.clone(),
            self.inner.shutdown.clone(),
        ));

        let start_refresh = {
            let mut state = self.inner.state.lock();
            state.listening.push(listening);
            state.endpoints = merge_endpoints(&state.listening, &self.inner.config.advertised_hosts);
            let start = bound.ip().is_unspecified() && !state.refreshing;
            if start {
                state.refreshing = true;
            }
            start
        };
        let _ = self
            .inner
            .events
            .send(ServerEvent::EndpointsChanged(self.endpoints()));
        if start_refresh {
            tokio::spawn(refresh_loop(
                Arc::downgrade(&self.inner),
                self.inner.config.endpoint_refresh_interval,
                self.inner.shutdown.clone(),
            ));
        }
        Ok(reachable)
    }

    /// Urls at which the server can currently be reached.
    pub fn endpoints(&self) -> Vec<Url> {
        self.inner.state.lock().endpoints.clone()
    }

    /// True once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop accepting on every endpoint. Accepted sockets are not affected.
    pub fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        tracing::debug!("TransportServer::close");
        self.inner.shutdown.cancel();
        let mut state = self.inner.state.lock();
        state.listening.clear();
        state.endpoints.clear();
    }
}

async fn resolve_listen_address(url: &Url, ipv6_enabled: bool) -> Result<SocketAddr, ServerError> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host(url.authority())
        .await
        .map_err(|e| ServerError::Resolve {
            url: url.to_string(),
            reason: e.to_string(),
        })?
        .collect();
    if let Some(v4) = resolved.iter().find(|a| a.is_ipv4()) {
        return Ok(*v4);
    }
    match resolved.first() {
        Some(v6) if ipv6_enabled => Ok(*v6),
        Some(_) => Err(ServerError::Ipv6Disabled {
            url: url.to_string(),
        }),
        None => Err(ServerError::Resolve {
            url: url.to_string(),
            reason: "no address found".to_string(),
        }),
    }
}

async fn accept_loop(
    listener: TcpListener,
    protocol: Protocol,
    acceptor: Option<TlsAcceptor>,
    config: SocketConfig,
    connections: mpsc::UnboundedSender<SharedSocket>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("accept_loop: shutdown requested");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually a descriptor limit; give the process room to recover.
                    tracing::warn!("accept_loop: accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("accept_loop: set_nodelay failed for {}: {}", peer, e);
        }
        let remote = Url::new(protocol, peer.ip().to_string(), peer.port());
        tracing::debug!("accept_loop: new connection from {}", remote);

        match &acceptor {
            None => deliver(&connections, Box::new(stream), remote, &config),
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                let connections = connections.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    match handshake(&acceptor, stream, config.connect_timeout).await {
                        Ok(stream) => deliver(&connections, stream, remote, &config),
                        Err(e) => tracing::warn!("accept_loop: handshake with {} failed: {}", remote, e),
                    }
                });
            }
        }
    }
}

async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    timeout: Duration,
) -> Result<BoxedStream, SocketError> {
    tokio::time::timeout(timeout, tls::accept(acceptor, stream))
        .await
        .unwrap_or_else(|_| Err(SocketError::Handshake("timed out".to_string())))
}

fn deliver(
    connections: &mpsc::UnboundedSender<SharedSocket>,
    stream: BoxedStream,
    remote: Url,
    config: &SocketConfig,
) {
    let socket: SharedSocket = Arc::new(TcpMessageSocket::accepted(stream, remote, config.clone()));
    if connections.send(socket).is_err() {
        tracing::debug!("accept_loop: nobody takes new connections, dropping it");
    }
}

async fn refresh_loop(inner: Weak<ServerInner>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        tracing::trace!("refresh_loop: checking endpoints");
        let changed = {
            let mut state = inner.state.lock();
            let current = merge_endpoints(&state.listening, &inner.config.advertised_hosts);
            if current != state.endpoints {
                state.endpoints = current.clone();
                Some(current)
            } else {
                None
            }
        };
        if let Some(endpoints) = changed {
            tracing::debug!("refresh_loop: endpoints changed to {:?}", endpoints);
            let _ = inner.events.send(ServerEvent::EndpointsChanged(endpoints));
        }
    }
}

/// Reachable urls of every bound endpoint, without duplicates.
fn merge_endpoints(listening: &[Listening], advertised: &[String]) -> Vec<Url> {
    let mut endpoints = Vec::new();
    for entry in listening {
        for url in listening_endpoints(entry, advertised) {
            if !endpoints.contains(&url) {
                endpoints.push(url);
            }
        }
    }
    endpoints
}

/// Reachable urls of one bound endpoint.
fn listening_endpoints(entry: &Listening, advertised: &[String]) -> Vec<Url> {
    let port = entry.bound.port();
    if !entry.bound.ip().is_unspecified() {
        return vec![entry.requested.with_port(port)];
    }

    let mut hosts = vec![if entry.bound.is_ipv4() {
        "127.0.0.1".to_string()
    } else {
        "::1".to_string()
    }];
    if let Some(primary) = primary_address(entry.bound.is_ipv4()) {
        hosts.push(primary.to_string());
    }
    hosts.extend(advertised.iter().cloned());

    let mut urls: Vec<Url> = Vec::new();
    for host in hosts {
        let url = Url::new(entry.requested.protocol(), host, port);
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}

/// Address of the interface holding the default route, if any.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
fn primary_address(ipv4: bool) -> Option<IpAddr> {
    let (bind, target) = if ipv4 {
        ("0.0.0.0:0", "192.0.2.1:9")
    } else {
        ("[::]:0", "[2001:db8::1]:9")
    };
    let socket = std::net::UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{MessageSocket, SocketStatus};

    #[tokio::test]
    async fn test_ephemeral_port_is_reported() {
        let server = TransportServer::new(SocketConfig::local_network());
        let url = Url::parse("tcp://127.0.0.1:0").expect("url");
        let endpoints = server.listen(&url).await.expect("listen");
        assert_eq!(endpoints.len(), 1);
        assert_ne!(endpoints[0].port(), 0);
        assert_eq!(endpoints[0].host(), "127.0.0.1");
        assert_eq!(server.endpoints(), endpoints);
        server.close();
    }

    #[tokio::test]
    async fn test_unspecified_bind_reports_loopback() {
        let server = TransportServer::new(ServerConfig {
            advertised_hosts: vec!["robot.local".to_string()],
            ..ServerConfig::from(SocketConfig::local_network())
        });
        let url = Url::parse("tcp://0.0.0.0:0").expect("url");
        let endpoints = server.listen(&url).await.expect("listen");
        assert!(endpoints.iter().any(|e| e.host() == "127.0.0.1"));
        assert!(endpoints.iter().any(|e| e.host() == "robot.local"));
        assert!(endpoints.iter().all(|e| e.port() == endpoints[0].port()));
        server.close();
    }

    #[tokio::test]
    async fn test_accepted_socket_is_delivered() {
        let server = TransportServer::new(SocketConfig::local_network());
        let mut incoming = server.new_connections().expect("receiver");
        assert!(server.new_connections().is_none());
        let endpoints = server
            .listen(&Url::parse("tcp://127.0.0.1:0").expect("url"))
            .await
            .expect("listen");

        let client = TcpMessageSocket::new(SocketConfig::local_network());
        client.connect(&endpoints[0]).await.expect("connect");
        let accepted = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
            .await
            .expect("in time")
            .expect("socket");
        assert_eq!(accepted.status(), SocketStatus::Connected);
        assert_eq!(
            accepted.remote_url().expect("remote").host(),
            "127.0.0.1"
        );
    }

    #[tokio::test]
    async fn test_tcps_without_certificate_fails() {
        let server = TransportServer::new(SocketConfig::local_network());
        let result = server
            .listen(&Url::parse("tcps://127.0.0.1:0").expect("url"))
            .await;
        assert!(matches!(result, Err(ServerError::MissingCertificate { .. })));
    }

    #[tokio::test]
    async fn test_listen_after_close_fails() {
        let server = TransportServer::new(SocketConfig::local_network());
        server.close();
        server.close();
        let result = server
            .listen(&Url::parse("tcp://127.0.0.1:0").expect("url"))
            .await;
        assert_eq!(result, Err(ServerError::Closed));
        assert!(server.endpoints().is_empty());
    }
}
