//! Per-run hub of WebSocket subscribers (§4.6 egress, §5 ordering/fairness).

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;

use crate::store::EventEnvelope;

/// Close code sent to a subscriber whose queue overflowed (§4.6).
pub const SLOW_CONSUMER_CLOSE_CODE: u16 = 4008;

struct Subscriber {
    sender: mpsc::Sender<EventEnvelope>,
}

/// One hub per run; `Hub::broadcast` delivers a freshly persisted event to
/// every subscriber in enqueue order. A subscriber whose bounded queue is
/// full is dropped and told to close with `SLOW_CONSUMER_CLOSE_CODE` rather
/// than blocking delivery to everyone else.
pub struct Hub {
    run_id: uuid::Uuid,
    subscribers: DashMap<u64, Subscriber>,
    next_id: std::sync::atomic::AtomicU64,
    queue_depth: usize,
}

impl Hub {
    pub fn new(run_id: uuid::Uuid, queue_depth: usize) -> Self {
        Self {
            run_id,
            subscribers: DashMap::new(),
            next_id: std::sync::atomic::AtomicU64::new(0),
            queue_depth,
        }
    }

    /// Registers a new subscriber and returns its receiving half along with
    /// an id that can be used to unregister on disconnect.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.insert(id, Subscriber { sender: tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Delivers `event` to every current subscriber. A full queue closes
    /// that subscriber's channel (the WS write loop observes the drop and
    /// sends the slow-consumer close frame) rather than blocking others.
    pub fn broadcast(&self, event: EventEnvelope) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(run_id = %self.run_id, subscriber = entry.key(), "slow consumer, dropping");
                    dead.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }
}

/// Registry of per-run hubs, created lazily on first subscribe/publish and
/// dropped once empty.
#[derive(Default)]
pub struct HubRegistry {
    hubs: DashMap<uuid::Uuid, std::sync::Arc<Hub>>,
    queue_depth: usize,
}

impl HubRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            hubs: DashMap::new(),
            queue_depth,
        }
    }

    pub fn hub_for(&self, run_id: uuid::Uuid) -> std::sync::Arc<Hub> {
        self.hubs
            .entry(run_id)
            .or_insert_with(|| std::sync::Arc::new(Hub::new(run_id, self.queue_depth)))
            .clone()
    }

    /// Drops the hub for `run_id` if it currently has no subscribers, so the
    /// registry does not grow unbounded across the lifetime of the process.
    pub fn reap_if_empty(&self, run_id: uuid::Uuid) {
        if let Some(hub) = self.hubs.get(&run_id) {
            if hub.is_empty() {
                drop(hub);
                self.hubs.remove(&run_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_event(seq: i64) -> EventEnvelope {
        EventEnvelope {
            run_id: uuid::Uuid::nil(),
            seq,
            ts: Utc::now(),
            kind: "node_update".to_string(),
            node: None,
            checkpoint_id: None,
            payload: serde_json::json!({}),
            partial_id: None,
            partial_index: None,
            partial_total: None,
        }
    }

    #[tokio::test]
    async fn broadcast_delivers_to_all_subscribers() {
        let hub = Hub::new(uuid::Uuid::nil(), 8);
        let (_id_a, mut rx_a) = hub.subscribe();
        let (_id_b, mut rx_b) = hub.subscribe();

        hub.broadcast(sample_event(1));

        assert_eq!(rx_a.recv().await.unwrap().seq, 1);
        assert_eq!(rx_b.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn full_queue_drops_the_slow_subscriber_only() {
        let hub = Hub::new(uuid::Uuid::nil(), 1);
        let (_id, mut rx) = hub.subscribe();

        hub.broadcast(sample_event(1));
        hub.broadcast(sample_event(2)); // queue depth 1: this one finds it full

        assert_eq!(hub.subscribers.len(), 0);
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn registry_reaps_empty_hubs() {
        let registry = HubRegistry::new(8);
        let run_id = uuid::Uuid::nil();
        let hub = registry.hub_for(run_id);
        let (id, _rx) = hub.subscribe();
        hub.unsubscribe(id);
        registry.reap_if_empty(run_id);
        assert!(registry.hubs.get(&run_id).is_none());
    }
}
