//! Tests for TransportSocketCache against real listeners.
//!
//! Tests verify that:
//! - Concurrent lookups for one machine share a single socket
//! - A dead endpoint among the candidates does not prevent the connection
//! - The last failing candidate reports the terminal error
//! - Disconnected sockets are evicted and closing fails pending lookups

use std::sync::Arc;
use std::time::Duration;

use qimessaging_transport::{
    MessageSocket, ProcessContext, ServiceInfo, SharedSocket, SocketCacheError, SocketConfig,
    TransportServer, TransportSocketCache, Url,
};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn listening_server() -> (TransportServer, mpsc::UnboundedReceiver<SharedSocket>, Url) {
    let server = TransportServer::new(SocketConfig::local_network());
    let incoming = server.new_connections().expect("receiver");
    let endpoints = server
        .listen(&Url::parse("tcp://127.0.0.1:0").expect("url"))
        .await
        .expect("listen");
    (server, incoming, endpoints[0].clone())
}

/// A loopback url nobody listens on.
async fn dead_url() -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    Url::parse(&format!("tcp://127.0.0.1:{port}")).expect("url")
}

fn service(machine_id: &str, endpoints: Vec<Url>) -> ServiceInfo {
    ServiceInfo {
        name: "echo".to_string(),
        service_id: 2,
        machine_id: machine_id.to_string(),
        endpoints,
        ..ServiceInfo::default()
    }
}

fn local_cache() -> TransportSocketCache {
    TransportSocketCache::new(
        ProcessContext::with_machine_id("local-machine"),
        SocketConfig::local_network(),
    )
}

#[tokio::test]
async fn test_concurrent_lookups_share_one_socket() {
    let (_server, _incoming, url) = listening_server().await;
    let cache = local_cache();
    let info = service("local-machine", vec![url]);

    let lookups: Vec<_> = (0..5).map(|_| cache.socket(&info, None)).collect();
    let sockets = tokio::time::timeout(TIMEOUT, futures::future::join_all(lookups))
        .await
        .expect("lookups in time");

    let first = sockets[0].clone().expect("connected");
    for socket in &sockets {
        let socket = socket.clone().expect("connected");
        assert!(Arc::ptr_eq(&first, &socket));
    }
    assert!(first.is_connected());
    assert_eq!(cache.machine_count(), 1);

    // A later lookup reuses the established connection.
    let again = cache.socket(&info, None).await.expect("cached");
    assert!(Arc::ptr_eq(&first, &again));
}

#[tokio::test]
async fn test_dead_candidate_does_not_win() {
    let (_server, _incoming, url) = listening_server().await;
    let cache = local_cache();
    let info = service("local-machine", vec![dead_url().await, url.clone()]);

    let socket = tokio::time::timeout(TIMEOUT, cache.socket(&info, None))
        .await
        .expect("in time")
        .expect("one candidate connects");
    assert_eq!(socket.remote_url(), Some(url));
}

#[tokio::test]
async fn test_all_candidates_failing_reports_once() {
    let cache = local_cache();
    let info = service("local-machine", vec![dead_url().await, dead_url().await]);

    let result = tokio::time::timeout(TIMEOUT, cache.socket(&info, None))
        .await
        .expect("in time");
    let error = result.err();
    assert_eq!(error, Some(SocketCacheError::NoEndpointReplied { service_id: 2 }));
    assert_eq!(
        error.map(|e| e.to_string()),
        Some("Could not connect to service #2: no endpoint replied.".to_string())
    );
    // The failed attempt is forgotten.
    assert_eq!(cache.machine_count(), 0);
}

#[tokio::test]
async fn test_disconnected_socket_is_evicted() {
    let (_server, _incoming, url) = listening_server().await;
    let cache = local_cache();
    let info = service("local-machine", vec![url]);

    let first = cache.socket(&info, None).await.expect("connected");
    cache.disconnect(&first).await;
    assert_eq!(cache.machine_count(), 0);

    let second = tokio::time::timeout(TIMEOUT, cache.socket(&info, None))
        .await
        .expect("in time")
        .expect("reconnected");
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.is_connected());
}

#[tokio::test]
async fn test_inserted_socket_is_reused() {
    let (_server, _incoming, url) = listening_server().await;
    let cache = local_cache();

    let socket = qimessaging_transport::make_message_socket(&url, SocketConfig::local_network());
    socket.connect(&url).await.expect("connect");
    cache.insert("remote-machine", &url, socket.clone());

    let info = service("remote-machine", vec![url]);
    let found = cache.socket(&info, None).await.expect("cached");
    assert!(Arc::ptr_eq(&found, &socket));
}

#[tokio::test]
async fn test_close_fails_future_lookups() {
    let (_server, _incoming, url) = listening_server().await;
    let cache = local_cache();
    let info = service("local-machine", vec![url]);
    let socket = cache.socket(&info, None).await.expect("connected");

    cache.close().await;
    assert!(!socket.is_connected());

    let mut lookup = tokio_test::task::spawn(cache.socket(&info, None));
    let result = tokio_test::assert_ready!(lookup.poll());
    assert_eq!(result.err(), Some(SocketCacheError::Closing));
}
