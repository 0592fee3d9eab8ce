use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Notifications published by the queue coordinator.
///
/// Every subscriber has its own unbounded channel, so a slow reader never
/// loses events: it sees each `Started`, `Log` and `Completed` of every build
/// that ran while it was subscribed, in order. Drop the receiver to
/// unsubscribe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildEvent {
    /// A queued record moved to `building`
    Started { build_id: String },

    /// Incremental build output
    Log { build_id: String, chunk: String },

    /// Sent exactly once per record that left the queue
    Completed { build_id: String, success: bool },
}

impl BuildEvent {
    pub fn build_id(&self) -> &str {
        match self {
            BuildEvent::Started { build_id }
            | BuildEvent::Log { build_id, .. }
            | BuildEvent::Completed { build_id, .. } => build_id,
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<BuildEvent>;

/// Fan-out of [`BuildEvent`]s to any number of subscribers
#[derive(Clone, Debug, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<BuildEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, forgetting dropped ones
    pub fn publish(&self, event: BuildEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
