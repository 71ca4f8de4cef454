//! Loopback tests for the TCP message socket.
//!
//! Tests verify that:
//! - Messages, sub-buffers included, cross a real connection intact and in order
//! - Concurrent disconnects converge on one teardown and one notification
//! - Calls still in flight when the connection dies get exactly one error
//! - Oversized or corrupted headers end the connection

use std::time::Duration;

use qimessaging_transport::{
    Buffer, DISCONNECTED_ERROR, HEADER_SIZE, MAGIC, Message, MessageAddress, MessageHeader,
    MessageSocket, MessageType, SharedSocket, SocketConfig, SocketEvent, SocketStatus,
    TransportServer, Url,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Start a server and return it with the receiver of accepted sockets and its url.
async fn start_server(
    config: SocketConfig,
) -> (TransportServer, mpsc::UnboundedReceiver<SharedSocket>, Url) {
    let server = TransportServer::new(config);
    let incoming = server.new_connections().expect("receiver");
    let endpoints = server
        .listen(&Url::parse("tcp://127.0.0.1:0").expect("url"))
        .await
        .expect("listen");
    (server, incoming, endpoints[0].clone())
}

async fn connected_pair() -> (TransportServer, SharedSocket, SharedSocket) {
    let (server, mut incoming, url) = start_server(SocketConfig::local_network()).await;
    let client = qimessaging_transport::make_message_socket(&url, SocketConfig::local_network());
    client.connect(&url).await.expect("connect");
    let accepted = tokio::time::timeout(TIMEOUT, incoming.recv())
        .await
        .expect("accepted in time")
        .expect("accepted");
    (server, client, accepted)
}

fn collect(socket: &SharedSocket, service: u32) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    socket
        .dispatcher()
        .message_pending_connect(service, 1, move |message: Message| {
            let _ = tx.send(message);
        });
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("message in time")
        .expect("message")
}

async fn wait_disconnected(events: &mut broadcast::Receiver<SocketEvent>) -> String {
    loop {
        match tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .expect("event in time")
            .expect("event")
        {
            SocketEvent::Disconnected { reason } => return reason,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let (_server, client, accepted) = connected_pair().await;
    let mut received = collect(&accepted, 10);
    accepted.start_reading();

    let mut sent = Vec::new();
    for index in 0..100u32 {
        let mut post = Message::new(MessageType::Post, MessageAddress::new(0, 10, 1, 100));
        if index % 10 == 0 {
            post.set_value(&(index, Buffer::from(vec![index as u8; 10_000])))
                .expect("encode");
        } else {
            post.set_value(&(index, Buffer::new())).expect("encode");
        }
        client.send(post.clone()).expect("send");
        sent.push(post);
    }

    for expected in &sent {
        let message = next(&mut received).await;
        assert_eq!(message.id(), expected.id());
        let (index, blob): (u32, Buffer) = message.value().expect("decode");
        let (_, expected_blob): (u32, Buffer) = expected.value().expect("decode");
        assert_eq!(blob.as_slice(), expected_blob.as_slice(), "message {index}");
    }
}

#[tokio::test]
async fn test_call_and_reply_round_trip() {
    let (_server, client, accepted) = connected_pair().await;

    // Echo server: every call is answered with its own payload.
    let echo = accepted.clone();
    accepted
        .dispatcher()
        .message_pending_connect(20, 1, move |call: Message| {
            let mut reply = Message::build_reply(&call);
            reply.set_buffer(call.buffer().clone());
            let _ = echo.send(reply);
        });
    accepted.start_reading();

    let mut replies = collect(&client, 20);
    let mut call = Message::new(MessageType::Call, MessageAddress::new(0, 20, 1, 100));
    call.set_value(&"ping").expect("encode");
    client.send(call.clone()).expect("send");
    assert_eq!(client.dispatcher().pending_count(), 1);

    let reply = next(&mut replies).await;
    assert_eq!(reply.message_type(), MessageType::Reply);
    assert_eq!(reply.id(), call.id());
    assert_eq!(reply.value::<String>().expect("decode"), "ping");
    assert_eq!(client.dispatcher().pending_count(), 0);
}

#[tokio::test]
async fn test_concurrent_disconnects_notify_once() {
    let (_server, client, _accepted) = connected_pair().await;
    let mut events = client.subscribe();

    let disconnects: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.disconnect().await })
        })
        .collect();
    for handle in disconnects {
        tokio::time::timeout(TIMEOUT, handle)
            .await
            .expect("disconnect completes")
            .expect("join");
    }
    assert_eq!(client.status(), SocketStatus::Disconnected);

    wait_disconnected(&mut events).await;
    // No second notification.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut extra = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SocketEvent::Disconnected { .. }) {
            extra += 1;
        }
    }
    assert_eq!(extra, 0);

    // Disconnecting again is a no-op.
    client.disconnect().await;
    assert!(client.send(Message::new(MessageType::Post, MessageAddress::new(0, 1, 1, 100))).is_err());
}

#[tokio::test]
async fn test_peer_death_fails_pending_calls() {
    let (_server, client, accepted) = connected_pair().await;
    let mut replies = collect(&client, 30);

    // The peer never reads, so the calls stay pending.
    let calls: Vec<Message> = (0..3)
        .map(|_| Message::new(MessageType::Call, MessageAddress::new(0, 30, 1, 100)))
        .collect();
    for call in &calls {
        client.send(call.clone()).expect("send");
    }
    accepted.disconnect().await;

    let mut ids = Vec::new();
    for _ in &calls {
        let error = next(&mut replies).await;
        assert_eq!(error.message_type(), MessageType::Error);
        assert_eq!(
            error.error_description().expect("description"),
            DISCONNECTED_ERROR
        );
        ids.push(error.id());
    }
    ids.sort_unstable();
    let mut expected: Vec<u32> = calls.iter().map(Message::id).collect();
    expected.sort_unstable();
    assert_eq!(ids, expected);

    // Exactly one outcome per call.
    assert!(tokio::time::timeout(Duration::from_millis(100), replies.recv())
        .await
        .map(|message| message.is_none())
        .unwrap_or(true));
}

#[tokio::test]
async fn test_oversized_header_ends_connection() {
    let config = SocketConfig::local_network().with_max_payload_size(10_000_000);
    let (_server, mut incoming, url) = start_server(config).await;

    let mut raw = TcpStream::connect(url.authority()).await.expect("connect");
    let accepted = tokio::time::timeout(TIMEOUT, incoming.recv())
        .await
        .expect("accepted in time")
        .expect("accepted");
    let mut events = accepted.subscribe();
    accepted.start_reading();

    let header = MessageHeader {
        magic: MAGIC,
        id: 1,
        size: 16_777_216,
        version: 0,
        message_type: MessageType::Call.code(),
        flags: 0,
        service: 2,
        object: 1,
        action: 100,
    };
    raw.write_all(&header.to_bytes()).await.expect("write");

    let reason = wait_disconnected(&mut events).await;
    assert!(reason.contains("16777216"), "{reason}");
    assert_eq!(accepted.status(), SocketStatus::Disconnected);
}

#[tokio::test]
async fn test_bad_magic_ends_connection() {
    let (_server, mut incoming, url) = start_server(SocketConfig::local_network()).await;

    let mut raw = TcpStream::connect(url.authority()).await.expect("connect");
    let accepted = tokio::time::timeout(TIMEOUT, incoming.recv())
        .await
        .expect("accepted in time")
        .expect("accepted");
    let mut events = accepted.subscribe();
    accepted.start_reading();

    raw.write_all(&[0x55u8; HEADER_SIZE]).await.expect("write");
    let reason = wait_disconnected(&mut events).await;
    assert!(reason.to_lowercase().contains("magic"), "{reason}");
}

#[tokio::test]
async fn test_dropping_socket_closes_connection() {
    let (_server, client, accepted) = connected_pair().await;
    let mut events = accepted.subscribe();
    accepted.start_reading();

    drop(client);
    wait_disconnected(&mut events).await;
    assert!(!accepted.is_connected());
}
