//! Tests for signals, hosted objects and the server control channel.
//!
//! Tests verify that:
//! - Signal emissions reach remote subscribers until they disconnect
//! - Objects handed out by a service are callable and die on terminate
//! - The server answers the authentication call with its capabilities
//! - Unknown control actions and unknown services are answered with errors

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use qimessaging::message::{action, object, service};
use qimessaging::server::{AUTH_STATE_DONE, AUTH_STATE_KEY};
use qimessaging::{
    CapabilityMap, CapabilityValue, MessageSocket, ObjectRef, RemoteObject, RpcError,
    SocketConfig, decode_args, make_message_socket,
};

#[tokio::test]
async fn test_signals_reach_remote_subscribers() {
    let (directory, url) = standalone().await;
    let provider = client(&url).await;
    provider
        .register_service("echo", Arc::new(Echo::default()))
        .await
        .expect("register");

    let consumer = client(&url).await;
    let echo = consumer.service("echo").await.expect("resolve");
    let remote = echo.as_remote().expect("remote proxy");
    let (link, mut pinged) = remote
        .connect_signal_by_name("pinged")
        .await
        .expect("connect signal");

    echo.call_method::<_, ()>("ping", &("first",))
        .await
        .expect("ping");
    let payload = tokio::time::timeout(TIMEOUT, pinged.recv())
        .await
        .expect("signal before timeout")
        .expect("signal");
    let (text,): (String,) = decode_args(&payload).expect("decode");
    assert_eq!(text, "first");

    remote.disconnect_signal(link).await.expect("disconnect signal");
    echo.call_method::<_, ()>("ping", &("second",))
        .await
        .expect("ping");
    let late = tokio::time::timeout(Duration::from_millis(300), pinged.recv()).await;
    assert!(!matches!(late, Ok(Some(_))), "emission after disconnect");

    assert_eq!(
        remote.connect_signal_by_name("missing").await.err(),
        Some(RpcError::NoSuchSignal("missing".to_string()))
    );

    consumer.close().await;
    provider.close().await;
    directory.close().await;
}

#[tokio::test]
async fn test_hosted_objects_live_until_terminated() {
    let (directory, url) = standalone().await;
    let provider = client(&url).await;
    provider
        .register_service("echo", Arc::new(Echo::default()))
        .await
        .expect("register");

    let consumer = client(&url).await;
    let echo = consumer.service("echo").await.expect("resolve");
    let socket = echo.as_remote().expect("remote proxy").socket().clone();

    let reference: ObjectRef = echo.call_method("spawn", &()).await.expect("spawn");
    assert_eq!(reference.service_id, 2);
    assert!(reference.object_id > object::MAIN);

    let counter = RemoteObject::from_object_ref(socket.clone(), &reference);
    let first: u32 = counter.call_method("increment", &()).await.expect("increment");
    let second: u32 = counter.call_method("increment", &()).await.expect("increment");
    assert_eq!((first, second), (1, 2));

    // Each call mints a distinct object.
    let other: ObjectRef = echo.call_method("spawn", &()).await.expect("spawn");
    assert_ne!(other.object_id, reference.object_id);

    counter.terminate().await.expect("terminate");
    let stale = RemoteObject::from_object_ref(socket, &reference);
    match stale.call_method::<_, u32>("increment", &()).await {
        Err(RpcError::Remote(text)) => assert!(text.starts_with("No such object"), "{text}"),
        other => panic!("expected a remote error, got {other:?}"),
    }

    consumer.close().await;
    provider.close().await;
    directory.close().await;
}

#[tokio::test]
async fn test_server_control_channel() {
    let (directory, url) = standalone().await;

    let socket = make_message_socket(&url, SocketConfig::local_network());
    socket.connect(&url).await.expect("connect");
    let control = RemoteObject::new(socket.clone(), service::SERVER, object::MAIN);

    let offered = CapabilityMap::new();
    let answer: CapabilityMap = control
        .call_typed(action::SERVER_AUTHENTICATE, &offered)
        .await
        .expect("authenticate");
    assert_eq!(
        answer.get(AUTH_STATE_KEY),
        Some(&CapabilityValue::Int(AUTH_STATE_DONE))
    );
    assert!(answer.len() > 1);

    let unknown = control.call_typed::<_, ()>(99, &()).await;
    assert_eq!(
        unknown,
        Err(RpcError::Remote("Unknown server action 99".to_string()))
    );

    let nowhere = RemoteObject::new(socket.clone(), 42, object::MAIN);
    match nowhere.call_typed::<_, ()>(action::META_OBJECT, &object::MAIN).await {
        Err(RpcError::Remote(text)) => assert_eq!(text, "Service 42 not found"),
        other => panic!("expected a remote error, got {other:?}"),
    }

    socket.disconnect().await;
    directory.close().await;
}
