//! Lifecycle events for subscribers (UI, reload coordination).
//!
//! All state changes flow through one broadcast bus. Subscribers that fall
//! behind lag and drop; publishing never blocks.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle states of an upstream process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// No child; a request will trigger a start.
    Stopped,
    /// Child launched, health probe in progress.
    Starting,
    /// Healthy and accepting proxied traffic.
    Ready,
    /// Draining in-flight requests before termination.
    Stopping,
    /// Manager closed; terminal.
    Shutdown,
    /// Launch or health check failed; a later request may retry.
    Failed,
}

impl ProcessState {
    /// Whether a child OS process exists in this state.
    pub const fn has_child(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Stopping)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Shutdown => "shutdown",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An event published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// A process changed state.
    ProcessState { model: String, state: ProcessState },
    /// A new configuration was applied.
    ConfigReloaded,
    /// The manager is shutting down.
    ShuttingDown,
}

/// Publish/subscribe bus for lifecycle events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; silently dropped when nobody listens.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn state_changed(&self, model: &str, state: ProcessState) {
        self.publish(Event::ProcessState {
            model: model.to_string(),
            state,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serialization() {
        let event = Event::ProcessState {
            model: "m1".to_string(),
            state: ProcessState::Ready,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"state\":\"ready\""));
        assert!(json.contains("\"model\":\"m1\""));
    }

    #[test]
    fn test_has_child_matches_lifecycle() {
        assert!(!ProcessState::Stopped.has_child());
        assert!(ProcessState::Starting.has_child());
        assert!(ProcessState::Ready.has_child());
        assert!(ProcessState::Stopping.has_child());
        assert!(!ProcessState::Shutdown.has_child());
        assert!(!ProcessState::Failed.has_child());
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.state_changed("m1", ProcessState::Starting);
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            Event::ProcessState {
                model: "m1".to_string(),
                state: ProcessState::Starting
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(Event::ConfigReloaded);
    }
}
