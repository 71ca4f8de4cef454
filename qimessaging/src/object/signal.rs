//! Signal subscribers and emission.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use qimessaging_core::to_buffer;
use qimessaging_transport::{
    Buffer, CodecError, Message, MessageAddress, MessageSocket, MessageType, SharedSocket,
    SocketError, SocketId,
};
use serde::Serialize;
use tokio::sync::mpsc;

enum Subscriber {
    Remote {
        event: u32,
        socket: SharedSocket,
        service: u32,
        object: u32,
    },
    Local {
        event: u32,
        sender: mpsc::UnboundedSender<Buffer>,
    },
}

impl Subscriber {
    fn event(&self) -> u32 {
        match self {
            Subscriber::Remote { event, .. } | Subscriber::Local { event, .. } => *event,
        }
    }
}

#[derive(Default)]
struct HubState {
    next_link: u64,
    subscribers: BTreeMap<u64, Subscriber>,
}

/// Subscribers of an object's signals.
///
/// Remote subscribers receive a `Type_Event` message addressed to the
/// service and object they subscribed through, with the event id as action.
/// Local subscribers receive the encoded payload on a channel.
///
/// Cloning yields another handle on the same subscribers.
#[derive(Clone, Default)]
pub struct SignalHub {
    state: Arc<Mutex<HubState>>,
}

impl SignalHub {
    /// Create a hub without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a peer reached through `socket`. Returns the local link id.
    pub fn connect_remote(&self, event: u32, socket: SharedSocket, service: u32, object: u32) -> u64 {
        self.insert(Subscriber::Remote {
            event,
            socket,
            service,
            object,
        })
    }

    /// Subscribe in-process. Returns the link id and the payload receiver.
    pub fn connect_local(&self, event: u32) -> (u64, mpsc::UnboundedReceiver<Buffer>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (self.insert(Subscriber::Local { event, sender }), receiver)
    }

    fn insert(&self, subscriber: Subscriber) -> u64 {
        let mut state = self.state.lock();
        state.next_link += 1;
        let link = state.next_link;
        state.subscribers.insert(link, subscriber);
        link
    }

    /// Remove a subscription. Returns false if `link` was unknown.
    pub fn disconnect(&self, link: u64) -> bool {
        self.state.lock().subscribers.remove(&link).is_some()
    }

    /// Remove every subscription made through `socket`.
    pub fn disconnect_socket(&self, socket: SocketId) -> usize {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|_, subscriber| {
            !matches!(subscriber, Subscriber::Remote { socket: owner, .. } if owner.id() == socket)
        });
        before - state.subscribers.len()
    }

    /// Number of subscribers of `event`.
    pub fn subscriber_count(&self, event: u32) -> usize {
        self.state
            .lock()
            .subscribers
            .values()
            .filter(|subscriber| subscriber.event() == event)
            .count()
    }

    /// Encode `args` and emit them on `event`.
    pub fn emit<T: Serialize + ?Sized>(&self, event: u32, args: &T) -> Result<(), CodecError> {
        self.emit_buffer(event, to_buffer(args)?);
        Ok(())
    }

    /// Emit an already encoded payload on `event`.
    ///
    /// Subscribers whose socket or channel is gone are dropped.
    pub fn emit_buffer(&self, event: u32, payload: Buffer) {
        let mut state = self.state.lock();
        state.subscribers.retain(|link, subscriber| match subscriber {
            Subscriber::Remote {
                event: wanted,
                socket,
                service,
                object,
            } => {
                if *wanted != event {
                    return true;
                }
                let mut message = Message::new(
                    MessageType::Event,
                    MessageAddress::new(0, *service, *object, event),
                );
                message.set_buffer(payload.clone());
                match socket.send(message) {
                    Ok(()) => true,
                    Err(SocketError::NotConnected) => {
                        tracing::debug!("SignalHub::emit dropping link {} on closed socket", link);
                        false
                    }
                    Err(error) => {
                        tracing::warn!("SignalHub::emit event {} to link {}: {}", event, link, error);
                        true
                    }
                }
            }
            Subscriber::Local {
                event: wanted,
                sender,
            } => *wanted != event || sender.send(payload.clone()).is_ok(),
        });
    }
}

impl std::fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHub")
            .field("subscribers", &self.state.lock().subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qimessaging_core::from_buffer;

    #[test]
    fn test_local_subscribers_receive_their_event_only() {
        let hub = SignalHub::new();
        let (_, mut fired) = hub.connect_local(100);
        let (_, mut other) = hub.connect_local(101);

        hub.emit(100, &(7u32, "seven")).expect("emit");

        let payload = fired.try_recv().expect("payload");
        let decoded: (u32, String) = from_buffer(&payload).expect("decode");
        assert_eq!(decoded, (7, "seven".to_string()));
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_and_dropped_receivers() {
        let hub = SignalHub::new();
        let (link, _receiver) = hub.connect_local(100);
        let (_, dropped) = hub.connect_local(100);
        drop(dropped);
        assert_eq!(hub.subscriber_count(100), 2);

        hub.emit_buffer(100, Buffer::new());
        assert_eq!(hub.subscriber_count(100), 1);

        assert!(hub.disconnect(link));
        assert!(!hub.disconnect(link));
        assert_eq!(hub.subscriber_count(100), 0);
    }
}
