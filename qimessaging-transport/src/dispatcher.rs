//! MessageDispatcher: (service, object) → subscriber routing.
//!
//! Each socket owns a dispatcher. Incoming messages are routed to the
//! handlers subscribed for their `(service, object)` pair and to those
//! subscribed for `(service, ALL_OBJECTS)`.
//!
//! Handlers never run inside [`dispatch`](MessageDispatcher::dispatch):
//! every subscription owns a queue drained by its own task, so the socket
//! read loop only enqueues. A handler may therefore send messages or change
//! subscriptions without deadlocking the reader. Messages reach a given
//! handler in the order they were dispatched.
//!
//! The dispatcher also remembers every outgoing call until its answer comes
//! back. When the socket dies, [`clean_pending_messages`](MessageDispatcher::clean_pending_messages)
//! turns each of them into an error reply so no caller waits forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::message::{Message, MessageAddress, MessageType};

/// Object id matching every object of a service.
pub const ALL_OBJECTS: u32 = u32::MAX;

/// Description carried by errors synthesized for calls lost on disconnect.
pub const DISCONNECTED_ERROR: &str = "Endpoint disconnected, message dropped";

/// Receives messages routed by a [`MessageDispatcher`].
///
/// Called from the subscription's own task, one message at a time.
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one message.
    fn handle(&self, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn handle(&self, message: Message) {
        self(message)
    }
}

/// Handle returned by [`MessageDispatcher::message_pending_connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    queue: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct DispatcherState {
    subscribers: Mutex<HashMap<(u32, u32), Vec<Subscriber>>>,
    sent: Mutex<HashMap<u32, MessageAddress>>,
    next_subscription: AtomicU64,
}

/// Routes incoming messages and tracks calls awaiting an answer.
///
/// Cloning yields another handle on the same dispatcher.
#[derive(Clone, Default)]
pub struct MessageDispatcher {
    state: Arc<DispatcherState>,
}

impl MessageDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `message` to its subscribers.
    ///
    /// Answers (`Reply`, `Error`, `Canceled`) first clear the matching
    /// outgoing call. Returns true if at least one subscriber received the
    /// message; unmatched messages are logged and otherwise ignored.
    pub fn dispatch(&self, message: &Message) -> bool {
        if matches!(
            message.message_type(),
            MessageType::Reply | MessageType::Error | MessageType::Canceled
        ) && self.state.sent.lock().remove(&message.id()).is_none()
        {
            tracing::debug!(
                "MessageDispatcher::dispatch answer {} matches no pending call",
                message.address()
            );
        }

        let mut delivered = 0usize;
        {
            let mut subscribers = self.state.subscribers.lock();
            for key in [
                (message.service(), message.object()),
                (message.service(), ALL_OBJECTS),
            ] {
                if let Some(list) = subscribers.get_mut(&key) {
                    // A closed queue means the handler task is gone.
                    list.retain(|subscriber| {
                        let alive = subscriber.queue.send(message.clone()).is_ok();
                        if alive {
                            delivered += 1;
                        }
                        alive
                    });
                    if list.is_empty() {
                        subscribers.remove(&key);
                    }
                }
                if message.object() == ALL_OBJECTS {
                    break;
                }
            }
        }

        if delivered == 0 {
            tracing::debug!(
                "MessageDispatcher::dispatch no subscriber for {}",
                message
            );
        }
        delivered > 0
    }

    /// Remember an outgoing call until its answer is dispatched.
    ///
    /// Only `Call` messages are tracked. An id already pending is a logged
    /// anomaly and keeps the first entry.
    pub fn sent(&self, message: &Message) {
        if message.message_type() != MessageType::Call {
            return;
        }
        let mut sent = self.state.sent.lock();
        if let Some(existing) = sent.get(&message.id()) {
            tracing::warn!(
                "MessageDispatcher::sent id {} already pending for {}, keeping it",
                message.id(),
                existing
            );
            return;
        }
        sent.insert(message.id(), message.address());
    }

    /// Number of calls still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.state.sent.lock().len()
    }

    /// Fail every pending call with a synthesized error reply.
    ///
    /// The errors go through [`dispatch`](Self::dispatch) like real answers.
    pub fn clean_pending_messages(&self) {
        let pending: Vec<MessageAddress> = {
            let mut sent = self.state.sent.lock();
            sent.drain().map(|(_, address)| address).collect()
        };
        if !pending.is_empty() {
            tracing::debug!(
                "MessageDispatcher::clean_pending_messages failing {} calls",
                pending.len()
            );
        }
        for address in pending {
            let mut error = Message::with_id(address.message_id, MessageType::Error, address);
            error.set_error(DISCONNECTED_ERROR);
            self.dispatch(&error);
        }
    }

    /// Subscribe `handler` to messages for `(service, object)`.
    ///
    /// Pass [`ALL_OBJECTS`] as `object` to receive every object of the
    /// service. Must be called from within a tokio runtime: the handler runs
    /// on a task spawned here.
    pub fn message_pending_connect<H: MessageHandler>(
        &self,
        service: u32,
        object: u32,
        handler: H,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.state.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (queue, mut receiver) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                handler.handle(message);
            }
        });
        self.state
            .subscribers
            .lock()
            .entry((service, object))
            .or_default()
            .push(Subscriber { id, queue });
        tracing::trace!(
            "MessageDispatcher::message_pending_connect {}.{} -> {:?}",
            service,
            object,
            id
        );
        id
    }

    /// Remove a subscription. Messages already queued are still delivered.
    ///
    /// Returns false if the subscription was unknown.
    pub fn message_pending_disconnect(
        &self,
        service: u32,
        object: u32,
        subscription: SubscriptionId,
    ) -> bool {
        let mut subscribers = self.state.subscribers.lock();
        let Some(list) = subscribers.get_mut(&(service, object)) else {
            return false;
        };
        let before = list.len();
        list.retain(|subscriber| subscriber.id != subscription);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&(service, object));
        }
        removed
    }

    /// Drop every subscription.
    pub fn clear_subscriptions(&self) {
        self.state.subscribers.lock().clear();
    }
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("subscriptions", &self.state.subscribers.lock().len())
            .field("pending", &self.pending_count())
            .finish()
    }
}
