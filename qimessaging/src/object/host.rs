//! Objects handed out over one connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use qimessaging_transport::{Message, MessageSocket, MessageType, SharedSocket};

use super::bound::ServiceBoundObject;

/// Bound objects minted for the peer of one socket.
///
/// Objects returned from calls through
/// [`CallContext::host_object`](super::CallContext::host_object) live here
/// until the peer terminates them or the socket disconnects.
#[derive(Clone, Default)]
pub struct ObjectHost {
    objects: Arc<Mutex<BTreeMap<u32, Arc<ServiceBoundObject>>>>,
}

impl ObjectHost {
    /// Create an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object under its object id.
    pub fn add(&self, object: Arc<ServiceBoundObject>) {
        self.objects.lock().insert(object.object_id(), object);
    }

    /// Remove an object.
    pub fn remove(&self, object_id: u32) -> Option<Arc<ServiceBoundObject>> {
        self.objects.lock().remove(&object_id)
    }

    /// Look an object up.
    pub fn object(&self, object_id: u32) -> Option<Arc<ServiceBoundObject>> {
        self.objects.lock().get(&object_id).cloned()
    }

    /// Number of hosted objects.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// True when nothing is hosted.
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Route a message to the hosted object it targets.
    ///
    /// Calls to unknown objects are answered with an error.
    pub fn on_message(&self, socket: &SharedSocket, message: Message) {
        let Some(object) = self.object(message.object()) else {
            tracing::debug!("ObjectHost::on_message no object for {}", message.address());
            if message.message_type() == MessageType::Call {
                let error = Message::build_error(
                    &message,
                    &format!("No such object {}", message.address()),
                );
                if let Err(error) = socket.send(error) {
                    tracing::debug!("ObjectHost::on_message reply failed: {}", error);
                }
            }
            return;
        };
        object.on_message(socket, self, message);
    }

    /// Drop every hosted object after `socket` went away.
    pub fn clear(&self, socket: &SharedSocket) {
        let objects: Vec<_> = {
            let mut objects = self.objects.lock();
            std::mem::take(&mut *objects).into_values().collect()
        };
        if !objects.is_empty() {
            tracing::debug!(
                "ObjectHost::clear dropping {} objects of {}",
                objects.len(),
                socket.id()
            );
        }
        for object in objects {
            object.socket_unbound(socket);
        }
    }
}

impl std::fmt::Debug for ObjectHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHost")
            .field("objects", &self.len())
            .finish()
    }
}
