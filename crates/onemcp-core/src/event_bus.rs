//! Event bus - domain event distribution.
//!
//! A thin wrapper over a tokio broadcast channel, exposing exactly the
//! surface the gateway uses: services emit through a cloned sender,
//! consumers (the notification fanout) receive through their own
//! subscription. A consumer that falls behind skips the lagged window
//! instead of stalling producers; reload application is serialized before
//! events are emitted, so ordering within one producer is preserved.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::event::DomainEvent;

/// Channel capacity; lagging consumers drop the oldest events past this.
const CAPACITY: usize = 256;

/// Central hub for domain event distribution.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CAPACITY);
        Self { sender }
    }

    /// Get a sender for emitting events. Cheap to clone.
    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    /// Subscribe to receive all events emitted after this call.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Used by services to emit domain events.
#[derive(Clone)]
pub struct EventSender {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventSender {
    /// Emit a domain event. Zero subscribers is not an error; the event is
    /// simply dropped.
    pub fn emit(&self, event: DomainEvent) {
        let type_name = event.type_name();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type = type_name, receivers = count, "emitted event");
            }
            Err(_) => {
                debug!(event_type = type_name, "no receivers for event");
            }
        }
    }
}

/// Used by consumers to receive domain events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event. Returns `None` once the channel is closed.
    /// Lag is logged and skipped.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped_events = skipped, "event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("event channel closed");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CapabilityKind, DomainEvent};

    #[tokio::test]
    async fn emit_and_receive() {
        let bus = EventBus::new();
        let sender = bus.sender();
        let mut receiver = bus.subscribe();

        sender.emit(DomainEvent::ListChanged {
            name: "github".into(),
            kind: CapabilityKind::Tools,
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.type_name(), "list_changed");
        assert_eq!(event.upstream(), Some("github"));
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let sender = bus.sender();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        sender.emit(DomainEvent::GatewayStarted {
            addr: "127.0.0.1:3050".into(),
        });

        assert_eq!(rx1.recv().await.unwrap().type_name(), "gateway_started");
        assert_eq!(rx2.recv().await.unwrap().type_name(), "gateway_started");
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.sender().emit(DomainEvent::GatewayStopped);
    }
}
