//! End-to-end tests for sessions over loopback TCP.
//!
//! Tests verify that:
//! - A service registered by a connected session gets id 2 and is listed
//! - Methods resolve by name and errors come back as their text
//! - Closing the registering session removes its service exactly once
//! - Losing the registering connection removes its service exactly once
//! - A conflicting registration is rejected with the directory's message
//! - Services registered locally resolve without a connection
//! - Registration requires a directory connection and a listening server

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use qimessaging::{
    MessageSocket, RpcError, SERVICE_DIRECTORY_NAME, ServiceDirectoryEvent, Session, SessionConfig, SessionError,
};

#[tokio::test]
async fn test_echo_service_lifecycle() {
    let (directory, url) = standalone().await;
    let mut events = directory.subscribe();

    let provider = client(&url).await;
    let service_id = provider
        .register_service("echo", Arc::new(Echo::default()))
        .await
        .expect("register");
    assert_eq!(service_id, 2);
    assert_eq!(
        next_registry_event(&mut events).await,
        ServiceDirectoryEvent::ServiceAdded(2, "echo".to_string())
    );

    let consumer = client(&url).await;
    let names: Vec<String> = consumer
        .services()
        .await
        .expect("services")
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert_eq!(names, vec![SERVICE_DIRECTORY_NAME.to_string(), "echo".to_string()]);

    let echo = consumer.service("echo").await.expect("resolve echo");
    assert!(!echo.is_local());
    assert_eq!(echo.service_id(), 2);
    let reply: String = echo.call_method("reply", &("hello",)).await.expect("reply");
    assert_eq!(reply, "hello");

    let failure = echo.call_method::<_, ()>("fail", &()).await;
    assert_eq!(failure, Err(RpcError::Remote("boom".to_string())));

    let missing = echo.call_method::<_, ()>("missing", &()).await;
    assert_eq!(missing, Err(RpcError::NoSuchMethod("missing".to_string())));

    provider.close().await;
    assert_eq!(
        next_registry_event(&mut events).await,
        ServiceDirectoryEvent::ServiceRemoved(2, "echo".to_string())
    );
    // No second removal follows the disconnect.
    let extra = tokio::time::timeout(Duration::from_millis(300), next_registry_event(&mut events)).await;
    assert!(extra.is_err(), "unexpected event {extra:?}");

    let names: Vec<String> = directory
        .services()
        .await
        .expect("services")
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert_eq!(names, vec![SERVICE_DIRECTORY_NAME.to_string()]);

    consumer.close().await;
    directory.close().await;
}

#[tokio::test]
async fn test_lost_connection_unregisters_services() {
    let (directory, url) = standalone().await;
    let mut events = directory.subscribe();

    let provider = client(&url).await;
    provider
        .register_service("echo", Arc::new(Echo::default()))
        .await
        .expect("register");
    assert_eq!(
        next_registry_event(&mut events).await,
        ServiceDirectoryEvent::ServiceAdded(2, "echo".to_string())
    );

    // Drop the link without unregistering.
    let socket = provider.directory_client().socket().expect("directory socket");
    socket.disconnect().await;

    assert_eq!(
        next_registry_event(&mut events).await,
        ServiceDirectoryEvent::ServiceRemoved(2, "echo".to_string())
    );
    let extra = tokio::time::timeout(Duration::from_millis(300), next_registry_event(&mut events)).await;
    assert!(extra.is_err(), "unexpected event {extra:?}");

    let names: Vec<String> = directory
        .services()
        .await
        .expect("services")
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert_eq!(names, vec![SERVICE_DIRECTORY_NAME.to_string()]);

    provider.close().await;
    directory.close().await;
}

#[tokio::test]
async fn test_conflicting_registration_is_rejected() {
    let (directory, url) = standalone().await;
    let first = client(&url).await;
    let second = client(&url).await;

    first
        .register_service("echo", Arc::new(Echo::default()))
        .await
        .expect("register");
    let error = second
        .register_service("echo", Arc::new(Echo::default()))
        .await
        .expect_err("conflict");
    assert_eq!(
        error,
        SessionError::Rpc(RpcError::Remote(
            "Service \"echo\" (#2) is already registered. Rejecting conflicting registration attempt."
                .to_string()
        ))
    );
    assert!(second.registered_services().is_empty());

    first.close().await;
    second.close().await;
    directory.close().await;
}

#[tokio::test]
async fn test_ids_are_not_reused() {
    let (directory, url) = standalone().await;
    let provider = client(&url).await;

    let first = provider
        .register_service("echo", Arc::new(Echo::default()))
        .await
        .expect("register");
    provider.unregister_service(first).await.expect("unregister");
    let second = provider
        .register_service("echo", Arc::new(Echo::default()))
        .await
        .expect("register again");
    assert_eq!((first, second), (2, 3));

    provider.close().await;
    directory.close().await;
}

#[tokio::test]
async fn test_local_services_resolve_in_process() {
    let (directory, _url) = standalone().await;
    let service_id = directory
        .register_service("echo", Arc::new(Echo::default()))
        .await
        .expect("register");
    assert_eq!(service_id, 2);

    let echo = directory.service("echo").await.expect("resolve");
    assert!(echo.is_local());
    let reply: String = echo.call_method("reply", &("local",)).await.expect("reply");
    assert_eq!(reply, "local");

    let registry = directory
        .service(SERVICE_DIRECTORY_NAME)
        .await
        .expect("directory object");
    assert!(registry.is_local());
    assert_eq!(registry.service_id(), 1);

    directory.close().await;
}

#[tokio::test]
async fn test_registration_preconditions() {
    let session = Session::new(SessionConfig::local_network());
    assert_eq!(
        session
            .register_service("echo", Arc::new(Echo::default()))
            .await
            .err(),
        Some(SessionError::NotConnected)
    );
    assert_eq!(
        session.listen(&loopback()).await.err(),
        Some(SessionError::NotConnected)
    );

    let (directory, url) = standalone().await;
    let connected = Session::new(SessionConfig::local_network());
    connected.connect(&url).await.expect("connect");
    assert_eq!(
        connected
            .register_service("echo", Arc::new(Echo::default()))
            .await
            .err(),
        Some(SessionError::NotListening)
    );
    assert_eq!(
        connected.listen_standalone(&[loopback()]).await.err(),
        Some(SessionError::AlreadyConnected)
    );

    connected.close().await;
    assert_eq!(
        connected.services().await.err(),
        Some(SessionError::Closed)
    );
    directory.close().await;
}
