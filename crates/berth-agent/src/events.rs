//! Outbound ports: where events go, and who is listening.

use berth_types::{ServerEvent, ServerId};

/// Broadcast sink for everything the orchestrator emits. Must not block.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: &ServerEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: &ServerEvent) {}
}

/// Which servers currently have at least one listener.
pub trait SubscriptionSource: Send + Sync + 'static {
    fn subscribed(&self) -> Vec<ServerId>;
}
