//! Event bus for policy decisions
//!
//! Pub/sub over a tokio broadcast channel. Publishing with no subscribers
//! is not an error.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::DomainEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Receiver lagged, {0} events dropped")]
    Lagged(u64),

    #[error("Channel closed")]
    ChannelClosed,
}

impl From<broadcast::error::RecvError> for EventBusError {
    fn from(err: broadcast::error::RecvError) -> Self {
        match err {
            broadcast::error::RecvError::Lagged(n) => Self::Lagged(n),
            broadcast::error::RecvError::Closed => Self::ChannelClosed,
        }
    }
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast bus for `DomainEvent`s
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all current subscribers; returns how many saw it
    pub fn publish(&self, event: DomainEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type, receivers = count, "Event published");
                count
            }
            Err(_) => {
                debug!(event_type, "Event published (no receivers)");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// A scoped filter rejects events that carry no matching scope
    pub fn matches(&self, event: &DomainEvent) -> bool {
        if let Some(ref uid) = self.user_id {
            if event.user_id() != Some(uid.as_str()) {
                return false;
            }
        }

        if let Some(ref rid) = self.request_id {
            if event.request_id() != Some(rid.as_str()) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// Receiver that only yields events matching its filter
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<DomainEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> EventBusResult<DomainEvent> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Drain already-buffered matching events without waiting
    pub fn drain(&mut self) -> Vec<DomainEvent> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => events.push(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}
