//! Event Gateway (§4.6) — ingress from runners, egress to subscribed UIs,
//! and the status side-effects an event kind implies.

pub mod hub;
pub mod ws;

use chrono::Utc;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::store::{EventEnvelope, Phase, RunStore, StatusPatch};
use hub::HubRegistry;

pub struct EventGateway {
    store: RunStore,
    hubs: HubRegistry,
}

impl EventGateway {
    pub fn new(store: RunStore, queue_depth: usize) -> Self {
        Self {
            store,
            hubs: HubRegistry::new(queue_depth),
        }
    }

    /// Ingests one runner-originated event (§4.6 ingress steps 1-4). The
    /// caller (HTTP/WS handler) has already authenticated the RunnerCredential
    /// and is responsible for verifying `event.run_id` matches the URL.
    #[instrument(skip(self, event), fields(run_id = %event.run_id, seq = event.seq))]
    pub async fn ingest(&self, project: &str, run_name: &str, event: EventEnvelope) -> Result<()> {
        self.store.append_event(&event).await?;
        self.apply_status_side_effects(project, run_name, &event).await?;
        self.hubs.hub_for(event.run_id).broadcast(event);
        Ok(())
    }

    async fn apply_status_side_effects(
        &self,
        project: &str,
        run_name: &str,
        event: &EventEnvelope,
    ) -> Result<()> {
        let patch = match event.kind.as_str() {
            "node_start" | "node_update" => StatusPatch {
                current_node: event.node.clone(),
                ..Default::default()
            },
            "interrupt" if event.checkpoint_id.is_some() => StatusPatch {
                awaiting_approval: Some(true),
                checkpoint_id: event.checkpoint_id.clone(),
                ..Default::default()
            },
            "node_end" => StatusPatch {
                awaiting_approval: Some(false),
                ..Default::default()
            },
            "error" => StatusPatch {
                phase: Some(Phase::Error),
                message: Some(summarize_payload(&event.payload)),
                is_error: Some(true),
                ..Default::default()
            },
            _ => return Ok(()),
        };
        self.store.update_status(project, run_name, patch).await?;
        Ok(())
    }

    /// Registers a new subscriber, returning the backfill (from `since_seq`,
    /// optionally collapsed per the partial-message rule) and a handle for
    /// the live tail (§4.6 egress, §5 ordering).
    pub async fn subscribe(
        &self,
        run_id: uuid::Uuid,
        since_seq: Option<i64>,
        include_partial_messages: bool,
    ) -> Result<(Vec<EventEnvelope>, u64, tokio::sync::mpsc::Receiver<EventEnvelope>)> {
        let hub = self.hubs.hub_for(run_id);
        let (id, rx) = hub.subscribe();
        let backfill = self.store.list_events(run_id, since_seq).await?;
        let backfill = if include_partial_messages {
            backfill
        } else {
            collapse_partials(backfill)
        };
        Ok((backfill, id, rx))
    }

    pub fn unsubscribe(&self, run_id: uuid::Uuid, subscriber_id: u64) {
        self.hubs.hub_for(run_id).unsubscribe(subscriber_id);
        self.hubs.reap_if_empty(run_id);
    }

    /// Forwards a subscriber-originated user message to the runner. Without
    /// a live runner WebSocket connection to push it over immediately, the
    /// message is appended to the event log as `type=user_message` for the
    /// runner to pick up on its next poll (§4.6).
    #[instrument(skip(self, payload))]
    pub async fn forward_user_message(
        &self,
        project: &str,
        run_name: &str,
        run_id: uuid::Uuid,
        payload: serde_json::Value,
    ) -> Result<()> {
        let seq = self.store.next_event_seq(run_id).await?;
        let event = EventEnvelope {
            run_id,
            seq,
            ts: Utc::now(),
            kind: "user_message".to_string(),
            node: None,
            checkpoint_id: None,
            payload,
            partial_id: None,
            partial_index: None,
            partial_total: None,
        };
        self.store.append_event(&event).await?;
        self.hubs.hub_for(run_id).broadcast(event);
        Ok(())
    }

    pub fn verify_run_id(&self, url_run_id: uuid::Uuid, event_run_id: uuid::Uuid) -> Result<()> {
        if url_run_id != event_run_id {
            return Err(Error::InvalidRequest(
                "event run_id does not match URL".to_string(),
            ));
        }
        Ok(())
    }
}

fn summarize_payload(payload: &serde_json::Value) -> String {
    payload
        .get("message")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string())
}

/// Collapses a `partial` group to its latest slot until the group's
/// non-partial successor arrives, at which point the whole group is dropped
/// from the replay (§4.6 partial-message collapsing).
fn collapse_partials(events: Vec<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut result = Vec::with_capacity(events.len());
    let mut latest_partial: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for event in events {
        if event.kind == "partial" {
            if let Some(group_id) = &event.partial_id {
                if let Some(&idx) = latest_partial.get(group_id) {
                    result[idx] = event;
                } else {
                    latest_partial.insert(group_id.clone(), result.len());
                    result.push(event);
                }
                continue;
            }
        }
        if let Some(group_id) = &event.partial_id {
            latest_partial.remove(group_id);
        }
        result.push(event);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial_event(group: &str, seq: i64, index: i32) -> EventEnvelope {
        EventEnvelope {
            run_id: uuid::Uuid::nil(),
            seq,
            ts: Utc::now(),
            kind: "partial".to_string(),
            node: None,
            checkpoint_id: None,
            payload: serde_json::json!({"text": format!("chunk-{index}")}),
            partial_id: Some(group.to_string()),
            partial_index: Some(index),
            partial_total: Some(3),
        }
    }

    fn final_event(group: &str, seq: i64) -> EventEnvelope {
        EventEnvelope {
            run_id: uuid::Uuid::nil(),
            seq,
            ts: Utc::now(),
            kind: "node_update".to_string(),
            node: Some("main".to_string()),
            checkpoint_id: None,
            payload: serde_json::json!({}),
            partial_id: Some(group.to_string()),
            partial_index: None,
            partial_total: None,
        }
    }

    #[test]
    fn collapses_partial_group_to_latest_slot() {
        let events = vec![
            partial_event("g1", 1, 0),
            partial_event("g1", 2, 1),
            partial_event("g1", 3, 2),
        ];
        let collapsed = collapse_partials(events);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].seq, 3);
    }

    #[test]
    fn drops_partial_group_once_successor_arrives() {
        let events = vec![
            partial_event("g1", 1, 0),
            partial_event("g1", 2, 1),
            final_event("g1", 3),
        ];
        let collapsed = collapse_partials(events);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].kind, "node_update");
    }

    #[test]
    fn summarize_payload_prefers_message_field() {
        let payload = serde_json::json!({"message": "boom"});
        assert_eq!(summarize_payload(&payload), "boom");
    }
}
