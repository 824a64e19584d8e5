//! Event handling for the SCA node
//!
//! Every status change of an authorisation or of a parent resource is
//! published on the [`EventBus`], both to a broadcast channel and to the
//! registered [`EventSubscriber`]s.

pub mod logger;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::error::ErrorKind;

/// Event types emitted by the SCA node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScaEvent {
    /// A new authorisation was started
    AuthorisationCreated {
        authorisation_id: String,
        parent_id: String,
        sca_approach: String,
    },
    /// The SCA status of an authorisation changed
    ScaStatusChanged {
        authorisation_id: String,
        parent_id: String,
        old_status: String,
        new_status: String,
    },
    /// A request against an authorisation was refused
    AuthorisationRejected {
        authorisation_id: String,
        error: ErrorKind,
        message: String,
    },
    /// An authorisation was failed because its deadline passed
    AuthorisationExpired {
        authorisation_id: String,
        parent_id: String,
    },
    /// The projected status of a consent or payment changed
    ParentStatusChanged {
        parent_id: String,
        old_status: String,
        new_status: String,
    },
}

/// Event subscriber trait for receiving node events
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Handle an SCA event
    async fn handle_event(&self, event: ScaEvent);
}

/// Event bus for publishing and subscribing to SCA events
pub struct EventBus {
    sender: broadcast::Sender<ScaEvent>,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);

        Self {
            sender,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to SCA events
    pub async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.push(subscriber);
    }

    /// Get a receiver for SCA events
    pub fn subscribe_channel(&self) -> broadcast::Receiver<ScaEvent> {
        self.sender.subscribe()
    }

    /// Remove a subscriber from the event bus
    pub async fn unsubscribe(&self, subscriber: &Arc<dyn EventSubscriber>) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !Arc::ptr_eq(s, subscriber));
    }

    /// Publish an event to the channel and all subscribers
    pub async fn publish(&self, event: ScaEvent) {
        // No receivers is fine
        let _ = self.sender.send(event.clone());

        for subscriber in self.subscribers.read().await.iter() {
            subscriber.handle_event(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ScaEvent>>,
    }

    #[async_trait]
    impl EventSubscriber for Recorder {
        async fn handle_event(&self, event: ScaEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_channel_and_subscribers() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(recorder.clone()).await;
        let mut rx = bus.subscribe_channel();

        let event = ScaEvent::AuthorisationExpired {
            authorisation_id: "a-1".to_string(),
            parent_id: "c-1".to_string(),
        };
        bus.publish(event.clone()).await;

        assert_eq!(rx.recv().await.unwrap(), event);
        assert_eq!(recorder.events.lock().unwrap().as_slice(), &[event]);

        let as_dyn: Arc<dyn EventSubscriber> = recorder.clone();
        bus.unsubscribe(&as_dyn).await;
        bus.publish(ScaEvent::AuthorisationExpired {
            authorisation_id: "a-2".to_string(),
            parent_id: "c-1".to_string(),
        })
        .await;
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
    }
}
