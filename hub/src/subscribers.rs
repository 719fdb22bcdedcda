use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use flowplane_common::models::conversation::WsFrame;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Frames a subscriber may fall behind by before it is dropped.
pub const SUBSCRIBER_QUEUE_SIZE: usize = 64;

struct Subscriber {
    id: Uuid,
    send: mpsc::Sender<WsFrame>,
}

/// Process-local fan-out registry: one entry per conversation, one bounded
/// queue per WebSocket subscriber.
///
/// Broadcasts never block: a subscriber whose queue is full is dropped on the
/// spot (its receiver closes, which ends its socket task). Frames are ordered
/// per subscriber, not across subscribers.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<Mutex<HashMap<Uuid, Vec<Subscriber>>>>,
}

impl SubscriberRegistry {
    pub fn subscribe(&self, conversation_id: Uuid) -> (Uuid, mpsc::Receiver<WsFrame>) {
        let (send, recv) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
        let id = Uuid::new_v4();

        self.inner
            .lock()
            .unwrap()
            .entry(conversation_id)
            .or_default()
            .push(Subscriber { id, send });

        (id, recv)
    }

    pub fn unsubscribe(&self, conversation_id: Uuid, subscriber_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subscribers) = inner.get_mut(&conversation_id) {
            subscribers.retain(|s| s.id != subscriber_id);
            if subscribers.is_empty() {
                inner.remove(&conversation_id);
            }
        }
    }

    pub fn broadcast(&self, conversation_id: Uuid, frame: &WsFrame) {
        let mut inner = self.inner.lock().unwrap();
        let Some(subscribers) = inner.get_mut(&conversation_id) else {
            return;
        };

        subscribers.retain(|subscriber| match subscriber.send.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(%conversation_id, subscriber = %subscriber.id, "dropping slow subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if subscribers.is_empty() {
            inner.remove(&conversation_id);
        }
    }

    pub fn subscriber_count(&self, conversation_id: Uuid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .get(&conversation_id)
            .map_or(0, Vec::len)
    }
}
