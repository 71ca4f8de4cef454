//! TCP (and TLS over TCP) message socket.
//!
//! All I/O of a connection runs in one background `connection_task`, which
//! selects over three branches:
//!
//! - the shutdown token, cancelled by `disconnect()` or by dropping the socket
//! - the read loop: header, payload, dispatch, repeat
//! - the write loop: pops the send queue and writes one message at a time
//!
//! Whichever branch finishes first ends the connection. The task then shuts
//! the stream down (bounded by `disconnect_timeout`), moves the socket to
//! `Disconnected`, fails the calls still waiting for an answer and emits
//! [`SocketEvent::Disconnected`] exactly once.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use qimessaging_core::{Buffer, CapabilityMap, Url};

use super::config::SocketConfig;
use super::error::{SocketError, SocketResult};
use super::{BoxedStream, MessageSocket, SocketEvent, SocketId, SocketStatus, tls};
use crate::dispatcher::MessageDispatcher;
use crate::message::{Message, MessageAddress, MessageType, object, service};
use crate::wire::{HEADER_SIZE, MessageHeader};

const EVENT_CAPACITY: usize = 256;

/// State of the socket, guarded by one mutex.
enum State {
    Disconnected,
    Connecting {
        attempt: u64,
        abort: CancellationToken,
    },
    Connected(Connection),
    Disconnecting {
        done: watch::Receiver<bool>,
    },
}

/// Handles on the running connection task.
struct Connection {
    outbox: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    reading: Arc<Notify>,
    done: watch::Receiver<bool>,
}

struct Inner {
    id: SocketId,
    config: SocketConfig,
    dispatcher: MessageDispatcher,
    events: broadcast::Sender<SocketEvent>,
    state: Mutex<State>,
    next_attempt: Mutex<u64>,
    remote_url: Mutex<Option<Url>>,
    remote_capabilities: Mutex<CapabilityMap>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        match &*self.state.lock() {
            State::Connected(connection) => connection.shutdown.cancel(),
            State::Connecting { abort, .. } => abort.cancel(),
            _ => {}
        }
    }
}

/// Message socket over TCP, optionally wrapped in TLS.
pub struct TcpMessageSocket {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TcpMessageSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMessageSocket")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("remote_url", &*self.inner.remote_url.lock())
            .finish()
    }
}

impl TcpMessageSocket {
    /// Create a disconnected socket.
    pub fn new(config: SocketConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                id: SocketId::next(),
                config,
                dispatcher: MessageDispatcher::new(),
                events,
                state: Mutex::new(State::Disconnected),
                next_attempt: Mutex::new(0),
                remote_url: Mutex::new(None),
                remote_capabilities: Mutex::new(CapabilityMap::new()),
            }),
        }
    }

    /// Wrap a stream accepted by a server.
    ///
    /// The socket is connected at once but reads nothing until
    /// [`start_reading`](MessageSocket::start_reading) is called.
    pub fn accepted(stream: BoxedStream, remote_url: Url, config: SocketConfig) -> Self {
        let socket = Self::new(config);
        *socket.inner.remote_url.lock() = Some(remote_url);
        let connection = start_connection(&socket.inner, stream);
        *socket.inner.state.lock() = State::Connected(connection);
        socket
    }
}

#[async_trait]
impl MessageSocket for TcpMessageSocket {
    fn id(&self) -> SocketId {
        self.inner.id
    }

    fn status(&self) -> SocketStatus {
        match &*self.inner.state.lock() {
            State::Disconnected => SocketStatus::Disconnected,
            State::Connecting { .. } => SocketStatus::Connecting,
            State::Connected(_) => SocketStatus::Connected,
            State::Disconnecting { .. } => SocketStatus::Disconnecting,
        }
    }

    fn remote_url(&self) -> Option<Url> {
        self.inner.remote_url.lock().clone()
    }

    async fn connect(&self, url: &Url) -> SocketResult<()> {
        let (attempt, abort) = {
            let mut state = self.inner.state.lock();
            match &*state {
                State::Disconnected => {}
                State::Connecting { .. } => {
                    return Err(SocketError::InvalidOperation(
                        "connect() while already connecting".to_string(),
                    ));
                }
                State::Connected(_) | State::Disconnecting { .. } => {
                    return Err(SocketError::InvalidOperation(
                        "connect() on a socket that is not disconnected".to_string(),
                    ));
                }
            }
            let attempt = {
                let mut next = self.inner.next_attempt.lock();
                *next += 1;
                *next
            };
            let abort = CancellationToken::new();
            *state = State::Connecting {
                attempt,
                abort: abort.clone(),
            };
            (attempt, abort)
        };
        *self.inner.remote_url.lock() = Some(url.clone());
        tracing::debug!("TcpMessageSocket::connect {} to {}", self.inner.id, url);

        let config = &self.inner.config;
        let established = tokio::select! {
            _ = abort.cancelled() => Err(SocketError::Aborted),
            result = tokio::time::timeout(config.connect_timeout, establish(url, config)) => {
                result.unwrap_or_else(|_| Err(SocketError::Connect {
                    url: url.to_string(),
                    reason: format!("timed out after {:?}", config.connect_timeout),
                }))
            }
        };

        let mut state = self.inner.state.lock();
        let still_ours = matches!(
            &*state,
            State::Connecting { attempt: current, abort } if *current == attempt && !abort.is_cancelled()
        );
        if !still_ours {
            tracing::debug!("TcpMessageSocket::connect {} aborted", self.inner.id);
            return Err(SocketError::Aborted);
        }
        match established {
            Ok(stream) => {
                let connection = start_connection(&self.inner, stream);
                connection.reading.notify_one();
                *state = State::Connected(connection);
                drop(state);
                tracing::debug!("TcpMessageSocket::connect {} connected to {}", self.inner.id, url);
                let _ = self.inner.events.send(SocketEvent::Connected);
                Ok(())
            }
            Err(e) => {
                *state = State::Disconnected;
                tracing::debug!("TcpMessageSocket::connect {} failed: {}", self.inner.id, e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        let mut done = {
            let mut state = self.inner.state.lock();
            match &*state {
                State::Disconnected => return,
                State::Connecting { abort, .. } => {
                    abort.cancel();
                    *state = State::Disconnected;
                    return;
                }
                State::Connected(connection) => {
                    connection.shutdown.cancel();
                    let done = connection.done.clone();
                    *state = State::Disconnecting { done: done.clone() };
                    done
                }
                State::Disconnecting { done } => done.clone(),
            }
        };
        tracing::debug!("TcpMessageSocket::disconnect {} waiting for teardown", self.inner.id);
        // The sender only goes away once the task is over, which is just as final.
        let _ = done.wait_for(|finished| *finished).await;
    }

    fn send(&self, message: Message) -> SocketResult<()> {
        let state = self.inner.state.lock();
        let State::Connected(connection) = &*state else {
            return Err(SocketError::NotConnected);
        };
        self.inner.dispatcher.sent(&message);
        tracing::trace!("TcpMessageSocket::send {} {}", self.inner.id, message);
        connection
            .outbox
            .send(message)
            .map_err(|_| SocketError::NotConnected)
    }

    fn start_reading(&self) {
        if let State::Connected(connection) = &*self.inner.state.lock() {
            connection.reading.notify_one();
        }
    }

    fn dispatcher(&self) -> &MessageDispatcher {
        &self.inner.dispatcher
    }

    fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.inner.events.subscribe()
    }

    fn remote_capabilities(&self) -> CapabilityMap {
        self.inner.remote_capabilities.lock().clone()
    }
}

/// Resolve, connect and optionally run the TLS handshake.
async fn establish(url: &Url, config: &SocketConfig) -> SocketResult<BoxedStream> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host(url.authority())
        .await
        .map_err(|e| SocketError::Resolve {
            host: url.host().to_string(),
            reason: e.to_string(),
        })?
        .collect();

    let (v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
        resolved.into_iter().partition(SocketAddr::is_ipv4);
    let candidates = if config.ipv6_enabled {
        v4.into_iter().chain(v6).collect::<Vec<_>>()
    } else if v4.is_empty() && !v6.is_empty() {
        return Err(SocketError::Ipv6Disabled {
            host: url.host().to_string(),
        });
    } else {
        v4
    };
    if candidates.is_empty() {
        return Err(SocketError::Resolve {
            host: url.host().to_string(),
            reason: "no address found".to_string(),
        });
    }

    let mut last_error = String::new();
    let mut connected = None;
    for address in candidates {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                connected = Some(stream);
                break;
            }
            Err(e) => {
                tracing::debug!("establish: {} refused: {}", address, e);
                last_error = e.to_string();
            }
        }
    }
    let stream = connected.ok_or_else(|| SocketError::Connect {
        url: url.to_string(),
        reason: last_error,
    })?;
    stream.set_nodelay(true)?;

    if url.protocol().is_tls() {
        tls::connect(stream, url.host()).await
    } else {
        Ok(Box::new(stream))
    }
}

/// Spawn the connection task and queue the capability advertisement.
fn start_connection(inner: &Arc<Inner>, stream: BoxedStream) -> Connection {
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let reading = Arc::new(Notify::new());
    let (done_tx, done) = watch::channel(false);

    if !inner.config.capabilities.is_empty() {
        let mut advertisement = Message::new(
            MessageType::Capability,
            MessageAddress::new(0, service::SERVER, object::MAIN, 0),
        );
        match advertisement.set_value(&inner.config.capabilities) {
            Ok(()) => {
                let _ = outbox.send(advertisement);
            }
            Err(e) => tracing::warn!("start_connection: cannot encode capabilities: {}", e),
        }
    }

    let task = ConnectionTask {
        inner: Arc::downgrade(inner),
        id: inner.id,
        config: inner.config.clone(),
        dispatcher: inner.dispatcher.clone(),
        events: inner.events.clone(),
        replies: outbox.clone(),
    };
    tokio::spawn(task.run(stream, outbox_rx, shutdown.clone(), reading.clone(), done_tx));

    Connection {
        outbox,
        shutdown,
        reading,
        done,
    }
}

/// Everything the background task needs, without keeping the socket alive.
struct ConnectionTask {
    inner: Weak<Inner>,
    id: SocketId,
    config: SocketConfig,
    dispatcher: MessageDispatcher,
    events: broadcast::Sender<SocketEvent>,
    replies: mpsc::UnboundedSender<Message>,
}

impl ConnectionTask {
    async fn run(
        self,
        stream: BoxedStream,
        mut outbox: mpsc::UnboundedReceiver<Message>,
        shutdown: CancellationToken,
        reading: Arc<Notify>,
        done: watch::Sender<bool>,
    ) {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let reason = tokio::select! {
            _ = shutdown.cancelled() => "disconnect requested".to_string(),
            result = async {
                reading.notified().await;
                self.read_loop(&mut reader).await
            } => match result {
                Ok(()) => "connection closed by peer".to_string(),
                Err(e) => {
                    tracing::warn!("connection_task: {} read failed: {}", self.id, e);
                    e.to_string()
                }
            },
            result = write_loop(&mut writer, &mut outbox) => match result {
                Ok(()) => "send queue closed".to_string(),
                Err(e) => {
                    tracing::warn!("connection_task: {} write failed: {}", self.id, e);
                    e.to_string()
                }
            },
        };

        if tokio::time::timeout(self.config.disconnect_timeout, writer.shutdown())
            .await
            .is_err()
        {
            tracing::debug!("connection_task: {} graceful shutdown timed out", self.id);
        }
        drop(reader);
        drop(writer);
        self.finish(reason, done);
    }

    async fn read_loop(&self, reader: &mut ReadHalf<BoxedStream>) -> SocketResult<()> {
        loop {
            let mut header_bytes = [0u8; HEADER_SIZE];
            match reader.read_exact(&mut header_bytes).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            let header = MessageHeader::deserialize(&header_bytes)?;
            header.check_magic()?;
            header.check_size(self.config.max_payload_size)?;

            let mut payload = Buffer::new();
            let slot = payload
                .reserve(header.size as usize)
                .map_err(|e| SocketError::Io(e.to_string()))?;
            reader.read_exact(slot).await?;

            self.on_message(Message::from_parts(header, payload));
        }
    }

    fn on_message(&self, message: Message) {
        if let Some(reason) = message.validation_error() {
            tracing::warn!(
                "connection_task: {} dropping invalid message {:?}: {}",
                self.id,
                message,
                reason
            );
            return;
        }

        if message.message_type() == MessageType::Capability {
            match message.value::<CapabilityMap>() {
                Ok(capabilities) => {
                    tracing::debug!("connection_task: {} remote capabilities {:?}", self.id, capabilities);
                    if let Some(inner) = self.inner.upgrade() {
                        inner.remote_capabilities.lock().extend(capabilities);
                    }
                }
                Err(e) => tracing::warn!("connection_task: {} bad capability map: {}", self.id, e),
            }
            return;
        }

        let started = Instant::now();
        let handled = self.dispatcher.dispatch(&message);
        let elapsed = started.elapsed();
        if !self.config.dispatch_warn_threshold.is_zero()
            && elapsed > self.config.dispatch_warn_threshold
        {
            tracing::warn!(
                "connection_task: {} dispatching {} took {:?}",
                self.id,
                message,
                elapsed
            );
        }

        if !handled && message.message_type() == MessageType::Call {
            let error = Message::build_error(&message, &format!("Service {} not found", message.service()));
            let _ = self.replies.send(error);
        }
        let _ = self.events.send(SocketEvent::MessageReady(message));
    }

    fn finish(self, reason: String, done: watch::Sender<bool>) {
        tracing::debug!("connection_task: {} disconnected: {}", self.id, reason);
        if let Some(inner) = self.inner.upgrade() {
            *inner.state.lock() = State::Disconnected;
        }
        self.dispatcher.clean_pending_messages();
        let _ = self.events.send(SocketEvent::Disconnected { reason });
        let _ = done.send(true);
    }
}

/// Write queued messages one at a time; sub-buffers are written in place.
async fn write_loop(
    writer: &mut WriteHalf<BoxedStream>,
    outbox: &mut mpsc::UnboundedReceiver<Message>,
) -> SocketResult<()> {
    while let Some(message) = outbox.recv().await {
        let header = message.wire_header()?;
        writer.write_all(&header.to_bytes()).await?;
        for segment in message.buffer().segments() {
            writer.write_all(segment).await?;
        }
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SharedSocket;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Accept one connection and wrap it in a reading socket.
    async fn pair() -> (SharedSocket, SharedSocket) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr");
        let url = Url::parse(&format!("tcp://{address}")).expect("url");

        let client: SharedSocket = Arc::new(TcpMessageSocket::new(SocketConfig::local_network()));
        let (connected, accepted) = tokio::join!(client.connect(&url), listener.accept());
        connected.expect("connect");
        let (stream, peer) = accepted.expect("accept");
        let server: SharedSocket = Arc::new(TcpMessageSocket::accepted(
            Box::new(stream),
            Url::parse(&format!("tcp://{peer}")).expect("url"),
            SocketConfig::local_network(),
        ));
        (client, server)
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let socket = TcpMessageSocket::new(SocketConfig::default());
        let message = Message::new(MessageType::Post, MessageAddress::new(0, 2, 1, 100));
        assert_eq!(socket.send(message), Err(SocketError::NotConnected));
        assert_eq!(socket.status(), SocketStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr");
        drop(listener);

        let socket = TcpMessageSocket::new(SocketConfig::local_network());
        let url = Url::parse(&format!("tcp://{address}")).expect("url");
        let result = socket.connect(&url).await;
        assert!(matches!(result, Err(SocketError::Connect { .. })), "{result:?}");
        assert_eq!(socket.status(), SocketStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_ipv6_only_host_fails_when_disabled() {
        let socket = TcpMessageSocket::new(SocketConfig::local_network().with_ipv6(false));
        let url = Url::parse("tcp://[::1]:1").expect("url");
        assert_eq!(
            socket.connect(&url).await,
            Err(SocketError::Ipv6Disabled {
                host: "::1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (client, server) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        server
            .dispatcher()
            .message_pending_connect(7, 1, move |message: Message| {
                let _ = tx.send(message);
            });
        server.start_reading();

        let mut post = Message::new(MessageType::Post, MessageAddress::new(0, 7, 1, 100));
        post.set_value(&("hello", Buffer::from(vec![3u8; 5000])))
            .expect("encode");
        client.send(post.clone()).expect("send");

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("in time")
            .expect("message");
        assert_eq!(received.id(), post.id());
        let (text, blob): (String, Buffer) = received.value().expect("decode");
        assert_eq!(text, "hello");
        assert_eq!(blob.as_slice(), &[3u8; 5000][..]);
    }

    #[tokio::test]
    async fn test_capabilities_are_exchanged() {
        let (client, server) = pair().await;
        server.start_reading();
        // Any round trip orders the capability message before the answer.
        let call = Message::new(MessageType::Call, MessageAddress::new(0, 42, 1, 100));
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .dispatcher()
            .message_pending_connect(42, 1, move |message: Message| {
                let _ = tx.send(message);
            });
        client.send(call).expect("send");
        let answer = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("in time")
            .expect("answer");
        assert_eq!(answer.message_type(), MessageType::Error);
        assert_eq!(
            answer.error_description().expect("description"),
            "Service 42 not found"
        );
        assert!(client.remote_capabilities().contains_key("ClientServerSocket"));
        assert!(server.remote_capabilities().contains_key("MessageFlags"));
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_aborts() {
        // A listener that never accepts keeps the handshake pending on TLS.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr");
        let socket = Arc::new(TcpMessageSocket::new(SocketConfig::default()));
        let url = Url::parse(&format!("tcps://{address}")).expect("url");

        let connecting = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.connect(&url).await })
        };
        while socket.status() != SocketStatus::Connecting {
            tokio::task::yield_now().await;
        }
        socket.disconnect().await;
        let result = connecting.await.expect("join");
        assert_eq!(result, Err(SocketError::Aborted));
        assert_eq!(socket.status(), SocketStatus::Disconnected);
        drop(listener);
    }
}
