//! Append-only event log (§3.1, §4.3). Idempotent on `(run_id, seq)`.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::instrument;

use super::models::EventEnvelope;
use crate::error::Result;

#[derive(sqlx::FromRow)]
struct EventRow {
    run_id: uuid::Uuid,
    seq: i64,
    ts: DateTime<Utc>,
    kind: String,
    node: Option<String>,
    checkpoint_id: Option<String>,
    payload: JsonValue,
    partial_id: Option<String>,
    partial_index: Option<i32>,
    partial_total: Option<i32>,
}

impl From<EventRow> for EventEnvelope {
    fn from(row: EventRow) -> Self {
        EventEnvelope {
            run_id: row.run_id,
            seq: row.seq,
            ts: row.ts,
            kind: row.kind,
            node: row.node,
            checkpoint_id: row.checkpoint_id,
            payload: row.payload,
            partial_id: row.partial_id,
            partial_index: row.partial_index,
            partial_total: row.partial_total,
        }
    }
}

/// Inserts `event`, ignoring the write if `(run_id, seq)` already exists
/// (§8 property 3 / round-trip law: replaying the same event is a no-op,
/// never an error, so runner retries after a network blip are safe).
#[instrument(skip(pool, event))]
pub async fn append_event(pool: &PgPool, event: &EventEnvelope) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO events (
            run_id, seq, ts, kind, node, checkpoint_id, payload,
            partial_id, partial_index, partial_total
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (run_id, seq) DO NOTHING
        "#,
    )
    .bind(event.run_id)
    .bind(event.seq)
    .bind(event.ts)
    .bind(&event.kind)
    .bind(&event.node)
    .bind(&event.checkpoint_id)
    .bind(&event.payload)
    .bind(&event.partial_id)
    .bind(event.partial_index)
    .bind(event.partial_total)
    .execute(pool)
    .await?;
    Ok(())
}

/// Lists events for `run_id` in ascending `seq`, optionally after `since_seq`.
pub async fn list_events(
    pool: &PgPool,
    run_id: uuid::Uuid,
    since_seq: Option<i64>,
) -> Result<Vec<EventEnvelope>> {
    let rows: Vec<EventRow> = sqlx::query_as(
        "SELECT * FROM events WHERE run_id = $1 AND seq > $2 ORDER BY seq",
    )
    .bind(run_id)
    .bind(since_seq.unwrap_or(-1))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(EventEnvelope::from).collect())
}

/// Next `seq` to use for an orchestrator-originated event (e.g. a queued
/// `user_message` when the runner has no open WebSocket, §4.6). Runner-
/// originated events carry their own `seq` and go through `append_event`
/// directly.
pub async fn next_seq(pool: &PgPool, run_id: uuid::Uuid) -> Result<i64> {
    let next: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq) + 1, 0) FROM events WHERE run_id = $1")
        .bind(run_id)
        .fetch_one(pool)
        .await?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_row_maps_all_fields() {
        let row = EventRow {
            run_id: uuid::Uuid::nil(),
            seq: 1,
            ts: Utc::now(),
            kind: "node_start".to_string(),
            node: Some("main".to_string()),
            checkpoint_id: None,
            payload: serde_json::json!({}),
            partial_id: None,
            partial_index: None,
            partial_total: None,
        };
        let envelope: EventEnvelope = row.into();
        assert_eq!(envelope.kind, "node_start");
        assert_eq!(envelope.node.as_deref(), Some("main"));
    }
}
