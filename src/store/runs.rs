//! Run rows: creation, status merge, lookup (§4.3).

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::instrument;

use super::models::{NewRun, Phase, Run, RunStatus, StatusPatch};
use crate::error::{Error, Result};
use crate::status_guard;

#[derive(sqlx::FromRow)]
struct RunRow {
    id: uuid::Uuid,
    project: String,
    name: String,
    workflow_name: String,
    workflow_version: String,
    graph: String,
    image_digest: String,
    inputs: JsonValue,
    display_name: Option<String>,
    parent_run: Option<String>,
    thread_id: Option<String>,
    phase: String,
    job_name: Option<String>,
    service_name: Option<String>,
    credential_secret: Option<String>,
    current_node: Option<String>,
    checkpoint_id: Option<String>,
    start_time: Option<DateTime<Utc>>,
    completion_time: Option<DateTime<Utc>>,
    message: Option<String>,
    is_error: Option<bool>,
    subtype: Option<String>,
    num_turns: Option<i32>,
    result_excerpt: Option<String>,
    awaiting_approval: bool,
    awaiting_approval_msg: Option<String>,
    awaiting_approval_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            project: self.project,
            name: self.name,
            workflow_name: self.workflow_name,
            workflow_version: self.workflow_version,
            graph: self.graph,
            image_digest: self.image_digest,
            inputs: self.inputs,
            display_name: self.display_name,
            parent_run: self.parent_run,
            thread_id: self.thread_id,
            status: RunStatus {
                phase: self.phase.parse()?,
                job_name: self.job_name,
                service_name: self.service_name,
                credential_secret: self.credential_secret,
                current_node: self.current_node,
                checkpoint_id: self.checkpoint_id,
                start_time: self.start_time,
                completion_time: self.completion_time,
                message: self.message,
                is_error: self.is_error,
                subtype: self.subtype,
                num_turns: self.num_turns,
                result_excerpt: self.result_excerpt,
                awaiting_approval: self.awaiting_approval,
                awaiting_approval_msg: self.awaiting_approval_msg,
                awaiting_approval_at: self.awaiting_approval_at,
            },
            created_at: self.created_at,
        })
    }
}

#[instrument(skip(pool, run))]
pub async fn create_run(pool: &PgPool, run: NewRun) -> Result<Run> {
    let existing: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM runs WHERE project = $1 AND name = $2")
            .bind(&run.project)
            .bind(&run.name)
            .fetch_optional(pool)
            .await?;
    if existing.is_some() {
        return Err(Error::AlreadyExists(format!(
            "run '{}' already exists in project '{}'",
            run.name, run.project
        )));
    }

    let row: RunRow = sqlx::query_as(
        r#"
        INSERT INTO runs (
            project, name, workflow_name, workflow_version, graph,
            image_digest, graphs, inputs, display_name, parent_run, thread_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING *
        "#,
    )
    .bind(&run.project)
    .bind(&run.name)
    .bind(&run.workflow_ref.name)
    .bind(&run.workflow_ref.version)
    .bind(&run.workflow_ref.graph)
    .bind(&run.image_digest)
    .bind(&run.graphs)
    .bind(&run.inputs)
    .bind(&run.display_name)
    .bind(&run.parent_run)
    .bind(&run.thread_id)
    .fetch_one(pool)
    .await?;

    row.into_run()
}

#[instrument(skip(pool))]
pub async fn get_run(pool: &PgPool, project: &str, name: &str) -> Result<Run> {
    let row: Option<RunRow> =
        sqlx::query_as("SELECT * FROM runs WHERE project = $1 AND name = $2")
            .bind(project)
            .bind(name)
            .fetch_optional(pool)
            .await?;
    row.ok_or_else(|| Error::NotFound(format!("run '{name}' not found")))?
        .into_run()
}

pub async fn list_runs(pool: &PgPool, project: &str) -> Result<Vec<Run>> {
    let rows: Vec<RunRow> =
        sqlx::query_as("SELECT * FROM runs WHERE project = $1 ORDER BY created_at")
            .bind(project)
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(RunRow::into_run).collect()
}

/// Merges a whitelisted status patch using the monotonic phase rule (§4.3,
/// §4.8). `patch.blocking` has no special effect here: the caller already
/// awaits this future to completion, which is the flush-before-2xx semantic
/// the runner relies on.
#[instrument(skip(pool, patch))]
pub async fn update_status(
    pool: &PgPool,
    project: &str,
    name: &str,
    patch: StatusPatch,
) -> Result<RunStatus> {
    let mut tx = pool.begin().await?;

    let current_phase_str: String = sqlx::query_scalar(
        "SELECT phase FROM runs WHERE project = $1 AND name = $2 FOR UPDATE",
    )
    .bind(project)
    .bind(name)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| Error::NotFound(format!("run '{name}' not found")))?;

    let current_phase: Phase = current_phase_str.parse()?;

    if let Some(next_phase) = patch.phase {
        status_guard::check_transition(current_phase, next_phase, patch.force)?;
    }

    let result_excerpt = patch
        .result_excerpt
        .as_deref()
        .map(status_guard::truncate_result_excerpt);
    let next_phase_str = patch.phase.map(|p| p.as_str().to_string());

    sqlx::query(
        r#"
        UPDATE runs SET
            phase = COALESCE($3, phase),
            message = COALESCE($4, message),
            is_error = COALESCE($5, is_error),
            num_turns = COALESCE($6, num_turns),
            result_excerpt = COALESCE($7, result_excerpt),
            subtype = COALESCE($8, subtype),
            current_node = COALESCE($9, current_node),
            checkpoint_id = COALESCE($10, checkpoint_id),
            start_time = COALESCE($11, start_time),
            completion_time = COALESCE($12, completion_time),
            awaiting_approval = COALESCE($13, awaiting_approval),
            awaiting_approval_msg = COALESCE($14, awaiting_approval_msg),
            awaiting_approval_at = CASE WHEN $13 IS NOT NULL THEN now() ELSE awaiting_approval_at END,
            job_name = COALESCE($15, job_name),
            service_name = COALESCE($16, service_name),
            credential_secret = COALESCE($17, credential_secret)
        WHERE project = $1 AND name = $2
        "#,
    )
    .bind(project)
    .bind(name)
    .bind(&next_phase_str)
    .bind(&patch.message)
    .bind(patch.is_error)
    .bind(patch.num_turns)
    .bind(&result_excerpt)
    .bind(&patch.subtype)
    .bind(&patch.current_node)
    .bind(&patch.checkpoint_id)
    .bind(patch.start_time)
    .bind(patch.completion_time)
    .bind(patch.awaiting_approval)
    .bind(&patch.awaiting_approval_msg)
    .bind(&patch.job_name)
    .bind(&patch.service_name)
    .bind(&patch.credential_secret)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(get_run(pool, project, name).await?.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_patch_defaults_are_all_none() {
        let patch = StatusPatch::default();
        assert!(patch.phase.is_none());
        assert!(!patch.force);
        assert!(!patch.blocking);
    }
}
