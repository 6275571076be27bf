use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::ApiType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    ProviderStatus {
        provider_id: String,
        status: ProviderStatus,
        api_type: ApiType,
        timestamp: DateTime<Utc>,
    },
    ConfigChanged {
        revision: u64,
    },
}

impl GatewayEvent {
    pub fn provider_status(provider_id: &str, status: ProviderStatus, api_type: ApiType) -> Self {
        GatewayEvent::ProviderStatus {
            provider_id: provider_id.to_string(),
            status,
            api_type,
            timestamp: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::ProviderStatus { .. } => "provider_status",
            GatewayEvent::ConfigChanged { .. } => "config_changed",
        }
    }
}

/// Fire-and-forget sink. Implementations must never block the caller.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: GatewayEvent);
}

/// In-process transport backed by a broadcast channel. Slow subscribers lag
/// and lose events instead of stalling publishers.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<GatewayEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastPublisher {
    fn publish(&self, event: GatewayEvent) {
        tracing::trace!(event = event.name(), "publish");
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.tx.send(event);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_does_not_fail() {
        let publisher = BroadcastPublisher::new(4);
        publisher.publish(GatewayEvent::ConfigChanged { revision: 1 });
    }

    #[tokio::test]
    async fn lagging_subscriber_never_blocks_publisher() {
        let publisher = BroadcastPublisher::new(2);
        let mut rx = publisher.subscribe();
        for revision in 0..10 {
            publisher.publish(GatewayEvent::ConfigChanged { revision });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            GatewayEvent::ConfigChanged { revision: 8 }
        );
    }

    #[test]
    fn provider_status_serializes_with_type_tag() {
        let event = GatewayEvent::provider_status("a", ProviderStatus::Pending, ApiType::OpenaiChat);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "provider_status");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["api_type"], "openai_chat");
    }
}
