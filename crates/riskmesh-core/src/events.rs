//! Observer channel for orchestration events.
//!
//! Every component publishes onto one [`EventBus`]; consumers call
//! [`EventBus::subscribe`] and receive every event published afterwards.
//! Publishing never blocks and never fails when nobody listens. Slow receivers
//! lag and lose the oldest events (see [`tokio::sync::broadcast`]).

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::circuit_breaker::CircuitState;
use crate::monitor::HealthState;
use crate::throttling::DenialReason;
use crate::{Category, ProviderId};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    TransportAttemptStarted {
        provider: ProviderId,
        attempt: u32,
        url: String,
    },
    TransportRetrying {
        provider: ProviderId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    TransportSucceeded {
        provider: ProviderId,
        attempts: u32,
        status: u16,
    },
    TransportExhausted {
        provider: ProviderId,
        attempts: u32,
        error: String,
    },
    CacheDegraded {
        operation: &'static str,
        error: String,
    },
    QuotaDenied {
        provider: ProviderId,
        reason: DenialReason,
        retry_after_ms: u64,
    },
    CircuitStateChanged {
        provider: ProviderId,
        from: CircuitState,
        to: CircuitState,
    },
    SourceFailed {
        request_id: Uuid,
        provider: ProviderId,
        code: &'static str,
        message: String,
    },
    FetchCompleted {
        request_id: Uuid,
        category: Category,
        source: String,
        latency_ms: u64,
    },
    FetchExhausted {
        request_id: Uuid,
        category: Category,
        attempted: Vec<ProviderId>,
    },
    HealthStatusChanged {
        provider: ProviderId,
        from: HealthState,
        to: HealthState,
    },
    AlertRaised {
        provider: ProviderId,
        consecutive_failures: u32,
        error_rate: f64,
    },
    AlertCleared {
        provider: ProviderId,
    },
}

/// Broadcast channel carrying [`OrchestratorEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        // No receivers is not an error for the publisher.
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(OrchestratorEvent::AlertCleared {
            provider: ProviderId::from_static("USGS"),
        });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();

        bus.publish(OrchestratorEvent::AlertRaised {
            provider: ProviderId::from_static("FEMA"),
            consecutive_failures: 5,
            error_rate: 1.0,
        });
        bus.publish(OrchestratorEvent::AlertCleared {
            provider: ProviderId::from_static("FEMA"),
        });

        assert!(matches!(
            receiver.recv().await,
            Ok(OrchestratorEvent::AlertRaised { .. })
        ));
        assert!(matches!(
            receiver.recv().await,
            Ok(OrchestratorEvent::AlertCleared { .. })
        ));
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let event = OrchestratorEvent::AlertCleared {
            provider: ProviderId::from_static("NOAA"),
        };
        let json = serde_json::to_value(&event).expect("serializes");
        assert_eq!(json["event"], "alert_cleared");
        assert_eq!(json["provider"], "NOAA");
    }
}
