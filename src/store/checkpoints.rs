//! Checkpoint CRUD and retention sweep (§3.1 Checkpoint lifecycle, SPEC_FULL §4.3 supplement).

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{info, instrument};

use super::models::Checkpoint;
use crate::error::{Error, Result};

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    thread_id: String,
    checkpoint_id: String,
    scope: String,
    scope_id: String,
    parent_checkpoint_id: Option<String>,
    state: JsonValue,
    updated_at: DateTime<Utc>,
}

impl From<CheckpointRow> for Checkpoint {
    fn from(row: CheckpointRow) -> Self {
        Checkpoint {
            thread_id: row.thread_id,
            checkpoint_id: row.checkpoint_id,
            scope: row.scope,
            scope_id: row.scope_id,
            parent_checkpoint_id: row.parent_checkpoint_id,
            state: row.state,
            updated_at: row.updated_at,
        }
    }
}

#[instrument(skip(pool, checkpoint))]
pub async fn put_checkpoint(pool: &PgPool, checkpoint: &Checkpoint) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO checkpoints (
            thread_id, checkpoint_id, scope, scope_id, parent_checkpoint_id, state, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, now())
        ON CONFLICT (thread_id, checkpoint_id) DO UPDATE SET
            state = EXCLUDED.state,
            parent_checkpoint_id = EXCLUDED.parent_checkpoint_id,
            updated_at = now()
        "#,
    )
    .bind(&checkpoint.thread_id)
    .bind(&checkpoint.checkpoint_id)
    .bind(&checkpoint.scope)
    .bind(&checkpoint.scope_id)
    .bind(&checkpoint.parent_checkpoint_id)
    .bind(&checkpoint.state)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_checkpoint(
    pool: &PgPool,
    thread_id: &str,
    checkpoint_id: &str,
) -> Result<Checkpoint> {
    let row: Option<CheckpointRow> = sqlx::query_as(
        "SELECT * FROM checkpoints WHERE thread_id = $1 AND checkpoint_id = $2",
    )
    .bind(thread_id)
    .bind(checkpoint_id)
    .fetch_optional(pool)
    .await?;
    row.map(Checkpoint::from).ok_or_else(|| {
        Error::NotFound(format!(
            "checkpoint '{checkpoint_id}' not found for thread '{thread_id}'"
        ))
    })
}

pub async fn list_checkpoints_for_scope(
    pool: &PgPool,
    scope: &str,
    scope_id: &str,
) -> Result<Vec<Checkpoint>> {
    let rows: Vec<CheckpointRow> = sqlx::query_as(
        "SELECT * FROM checkpoints WHERE scope = $1 AND scope_id = $2 ORDER BY updated_at",
    )
    .bind(scope)
    .bind(scope_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Checkpoint::from).collect())
}

/// Deletes checkpoints whose thread has no run in `Running`/`AwaitingInput`
/// and whose last write predates `retention` (§3.1 Checkpoint lifecycle).
#[instrument(skip(pool))]
pub async fn sweep_expired_checkpoints(pool: &PgPool, retention: Duration) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::from_std(retention).map_err(|e| {
        Error::Internal(anyhow::anyhow!("checkpoint retention duration overflow: {e}"))
    })?;

    let result = sqlx::query(
        r#"
        DELETE FROM checkpoints c
        WHERE c.updated_at < $1
          AND NOT EXISTS (
              SELECT 1 FROM runs r
              WHERE r.thread_id = c.thread_id
                AND r.phase IN ('Running', 'AwaitingInput')
          )
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    let deleted = result.rows_affected();
    if deleted > 0 {
        info!(deleted, "swept expired checkpoints");
    }
    Ok(deleted)
}
