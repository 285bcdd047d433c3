use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use berth_agent::{EventSink, SubscriptionSource};
use berth_types::{ServerEvent, ServerId};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(serde::Serialize)]
struct WireEvent<'a> {
    topic: String,
    #[serde(flatten)]
    event: &'a ServerEvent,
}

/// Per-server broadcast channels feeding WebSocket subscribers.
#[derive(Clone, Default)]
pub struct SubscriptionHub {
    inner: Arc<RwLock<HashMap<ServerId, broadcast::Sender<String>>>>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, server_id: &ServerId) -> broadcast::Receiver<String> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .entry(server_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drops channels nobody listens to any more.
    pub fn prune(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, tx| tx.receiver_count() > 0);
    }

    /// Drops every channel; subscribers see their stream end.
    pub fn close_all(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn subscriber_count(&self, server_id: &ServerId) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl EventSink for SubscriptionHub {
    fn publish(&self, event: &ServerEvent) {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = inner.get(event.server_id()) else {
            return;
        };
        if tx.receiver_count() == 0 {
            return;
        }
        let wire = WireEvent {
            topic: event.topic(),
            event,
        };
        match serde_json::to_string(&wire) {
            Ok(json) => {
                let _ = tx.send(json);
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode event"),
        }
    }
}

impl SubscriptionSource for SubscriptionHub {
    fn subscribed(&self) -> Vec<ServerId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, tx)| tx.receiver_count() > 0)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use berth_types::LifecycleKind;

    use super::*;

    fn sid(s: &str) -> ServerId {
        ServerId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn subscribers_receive_only_their_server() {
        let hub = SubscriptionHub::new();
        let mut alpha = hub.subscribe(&sid("alpha"));
        let mut beta = hub.subscribe(&sid("beta"));

        hub.publish(&ServerEvent::Lifecycle {
            server_id: sid("alpha"),
            kind: LifecycleKind::Started,
        });

        let msg: serde_json::Value = serde_json::from_str(&alpha.recv().await.unwrap()).unwrap();
        assert_eq!(msg["topic"], "server:alpha:started");
        assert_eq!(msg["type"], "lifecycle");
        assert!(beta.try_recv().is_err());
    }

    #[test]
    fn subscribed_tracks_live_receivers() {
        let hub = SubscriptionHub::new();
        let rx = hub.subscribe(&sid("alpha"));
        assert_eq!(hub.subscribed(), vec![sid("alpha")]);
        assert_eq!(hub.subscriber_count(&sid("alpha")), 1);

        drop(rx);
        assert!(hub.subscribed().is_empty());
        hub.prune();
        assert_eq!(hub.subscriber_count(&sid("alpha")), 0);
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let hub = SubscriptionHub::new();
        hub.publish(&ServerEvent::Log {
            server_id: sid("ghost"),
            message: "hi".to_string(),
        });
        assert!(hub.subscribed().is_empty());
    }
}
