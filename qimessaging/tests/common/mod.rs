//! Services and helpers shared by the session tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use qimessaging::{
    Buffer, CallContext, MetaObject, RpcError, ServiceDirectoryEvent, ServiceObject, Session,
    SessionConfig, SignalHub, Url, decode_args, encode_reply,
};
use tokio::sync::broadcast;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const REPLY: u32 = 100;
pub const FAIL: u32 = 101;
pub const SPAWN: u32 = 102;
pub const PINGED: u32 = 103;
pub const PING: u32 = 104;

/// Echoes strings, emits `pinged` and hands out counters.
#[derive(Default)]
pub struct Echo {
    hub: SignalHub,
}

#[async_trait]
impl ServiceObject for Echo {
    fn meta_object(&self) -> MetaObject {
        MetaObject::new()
            .with_method(REPLY, "reply", "(s)", "s")
            .with_method(FAIL, "fail", "()", "v")
            .with_method(SPAWN, "spawn", "()", "o")
            .with_method(PING, "ping", "(s)", "v")
            .with_signal(PINGED, "pinged", "(s)")
    }

    async fn call(&self, ctx: &CallContext, action: u32, args: Buffer) -> Result<Buffer, RpcError> {
        match action {
            REPLY => {
                let (text,): (String,) = decode_args(&args)?;
                encode_reply(&text)
            }
            FAIL => Err(RpcError::Failed("boom".to_string())),
            SPAWN => {
                let object = ctx.host_object(Arc::new(Counter::default()))?;
                encode_reply(&object)
            }
            PING => {
                let (text,): (String,) = decode_args(&args)?;
                self.hub.emit(PINGED, &(text,))?;
                encode_reply(&())
            }
            other => Err(RpcError::NoSuchMethod(other.to_string())),
        }
    }

    fn signal_hub(&self) -> Option<&SignalHub> {
        Some(&self.hub)
    }
}

pub const INCREMENT: u32 = 100;

/// Object minted per caller by [`Echo`].
#[derive(Default)]
pub struct Counter {
    value: AtomicU32,
}

#[async_trait]
impl ServiceObject for Counter {
    fn meta_object(&self) -> MetaObject {
        MetaObject::new().with_method(INCREMENT, "increment", "()", "I")
    }

    async fn call(&self, _ctx: &CallContext, action: u32, _args: Buffer) -> Result<Buffer, RpcError> {
        match action {
            INCREMENT => encode_reply(&(self.value.fetch_add(1, Ordering::SeqCst) + 1)),
            other => Err(RpcError::NoSuchMethod(other.to_string())),
        }
    }
}

pub fn loopback() -> Url {
    Url::parse("tcp://127.0.0.1:0").expect("url")
}

/// A session hosting the directory, and its url.
pub async fn standalone() -> (Session, Url) {
    qimessaging::logging::init_test_tracing();
    let session = Session::new(SessionConfig::local_network());
    let endpoints = session
        .listen_standalone(&[loopback()])
        .await
        .expect("listen_standalone");
    (session, endpoints[0].clone())
}

/// A session connected to `url` and serving on loopback.
pub async fn client(url: &Url) -> Session {
    let session = Session::new(SessionConfig::local_network());
    session.connect(url).await.expect("connect");
    session.listen(&loopback()).await.expect("listen");
    session
}

/// Next directory event, skipping connection events.
pub async fn next_registry_event(
    events: &mut broadcast::Receiver<ServiceDirectoryEvent>,
) -> ServiceDirectoryEvent {
    loop {
        let event = tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .expect("event before timeout")
            .expect("event");
        match event {
            ServiceDirectoryEvent::ServiceAdded(..) | ServiceDirectoryEvent::ServiceRemoved(..) => {
                return event;
            }
            _ => continue,
        }
    }
}
