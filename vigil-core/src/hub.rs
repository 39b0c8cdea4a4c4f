//! Fan-out of push events to connected subscribers.
//!
//! One worker task owns the subscriber registry; everything else talks to it
//! through register / unregister / broadcast commands, so the registry never
//! crosses a task boundary. Each subscriber gets a bounded queue: a
//! subscriber that stops draining is dropped and disconnected instead of
//! stalling the fan-out loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::CoreError;
use crate::events::EventMessage;

const NAME: &str = "event hub";

enum Command {
    Register {
        id: u64,
        queue: mpsc::Sender<EventMessage>,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        id: u64,
    },
    Broadcast {
        message: EventMessage,
    },
}

/// A registered push subscriber's receiving end.
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<EventMessage>,
}

/// Handle to the fan-out worker.
#[derive(Clone)]
pub struct EventHub {
    tx: mpsc::Sender<Command>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl EventHub {
    /// Spawn the fan-out worker. `queue_capacity` bounds each subscriber's
    /// outbound queue.
    #[must_use]
    pub fn spawn(queue_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(64);
        tokio::spawn(async move {
            let mut subscribers: HashMap<u64, mpsc::Sender<EventMessage>> = HashMap::new();
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Register { id, queue, reply } => {
                        subscribers.insert(id, queue);
                        debug!("subscriber {id} registered ({} active)", subscribers.len());
                        let _ = reply.send(());
                    }
                    Command::Unregister { id } => {
                        if subscribers.remove(&id).is_some() {
                            debug!("subscriber {id} unregistered ({} active)", subscribers.len());
                        }
                    }
                    Command::Broadcast { message } => {
                        subscribers.retain(|id, queue| {
                            match queue.try_send(message.clone()) {
                                Ok(()) => true,
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    warn!("subscriber {id} is not draining, dropping it");
                                    false
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => false,
                            }
                        });
                    }
                }
            }
        });
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity,
        }
    }

    /// Register a new subscriber and hand back its event queue.
    pub async fn subscribe(&self) -> Result<Subscription, CoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, events) = mpsc::channel(self.queue_capacity);
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Register { id, queue, reply })
            .await
            .map_err(|_| CoreError::WorkerGone(NAME))?;
        rx.await.map_err(|_| CoreError::WorkerGone(NAME))?;
        Ok(Subscription { id, events })
    }

    /// Remove a subscriber and close its queue.
    pub async fn unsubscribe(&self, id: u64) {
        let _ = self.tx.send(Command::Unregister { id }).await;
    }

    /// Enqueue a message to every registered subscriber.
    ///
    /// Failure here means the worker is gone during shutdown; events are
    /// best-effort notifications, so it is logged and swallowed.
    pub async fn publish(&self, message: EventMessage) {
        if self.tx.send(Command::Broadcast { message }).await.is_err() {
            warn!("{NAME} is gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn event(id: i64) -> EventMessage {
        EventMessage::update(EventKind::Host, id, 0)
    }

    #[tokio::test]
    async fn each_subscriber_sees_events_in_submission_order() {
        let hub = EventHub::spawn(8);
        let mut first = hub.subscribe().await.unwrap();
        let mut second = hub.subscribe().await.unwrap();

        for id in [1, 2, 3] {
            hub.publish(event(id)).await;
        }
        for sub in [&mut first, &mut second] {
            for id in [1, 2, 3] {
                assert_eq!(sub.events.recv().await.unwrap().object.id, id);
            }
        }
    }

    #[tokio::test]
    async fn unsubscribed_queue_closes() {
        let hub = EventHub::spawn(8);
        let mut sub = hub.subscribe().await.unwrap();
        hub.unsubscribe(sub.id).await;
        hub.publish(event(1)).await;
        assert!(sub.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn stuck_subscriber_is_dropped_without_stalling_others() {
        let hub = EventHub::spawn(1);
        let mut slow = hub.subscribe().await.unwrap();

        // The queue holds one message; the second overflows and evicts the
        // subscriber instead of blocking the loop.
        hub.publish(event(1)).await;
        hub.publish(event(2)).await;

        let mut live = hub.subscribe().await.unwrap();
        hub.publish(event(3)).await;
        assert_eq!(live.events.recv().await.unwrap().object.id, 3);

        assert_eq!(slow.events.recv().await.unwrap().object.id, 1);
        assert!(slow.events.recv().await.is_none());
    }
}
