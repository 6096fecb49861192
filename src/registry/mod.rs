//! Registry (§4.1) — stores workflow definitions per project and enforces
//! the image allow-list and digest/graph-ref validation contracts.

pub mod model;

use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::{info, instrument};

use crate::error::{Error, Result};
pub use model::{GraphRef, Workflow, WorkflowVersion};
use model::{matches_allow_list, validate_digest};

#[derive(Clone)]
pub struct Registry {
    pool: PgPool,
    allowed_registries: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    version: String,
    image_digest: String,
    graphs: JsonValue,
    inputs_schema: Option<JsonValue>,
}

impl Registry {
    pub fn new(pool: PgPool, allowed_registries: Vec<String>) -> Self {
        Self {
            pool,
            allowed_registries,
        }
    }

    #[instrument(skip(self, first_version))]
    pub async fn register_workflow(
        &self,
        project: &str,
        name: &str,
        owner: &str,
        first_version: WorkflowVersion,
    ) -> Result<Workflow> {
        self.validate_version(&first_version)?;

        let mut tx = self.pool.begin().await?;

        let existing: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM workflows WHERE project = $1 AND name = $2",
        )
        .bind(project)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Err(Error::AlreadyExists(format!(
                "workflow '{name}' already exists in project '{project}'"
            )));
        }

        let workflow_id: uuid::Uuid = sqlx::query_scalar(
            "INSERT INTO workflows (project, name, owner) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(project)
        .bind(name)
        .bind(owner)
        .fetch_one(&mut *tx)
        .await?;

        insert_version(&mut tx, workflow_id, &first_version).await?;
        tx.commit().await?;

        info!(project, name, owner, "registered workflow");
        Ok(Workflow {
            project: project.to_string(),
            name: name.to_string(),
            owner: owner.to_string(),
        })
    }

    #[instrument(skip(self, version))]
    pub async fn add_version(
        &self,
        project: &str,
        name: &str,
        version: WorkflowVersion,
    ) -> Result<()> {
        self.validate_version(&version)?;

        let mut tx = self.pool.begin().await?;
        let workflow_id: uuid::Uuid = sqlx::query_scalar(
            "SELECT id FROM workflows WHERE project = $1 AND name = $2",
        )
        .bind(project)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("workflow '{name}' not found")))?;

        let duplicate: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM workflow_versions WHERE workflow_id = $1 AND version = $2",
        )
        .bind(workflow_id)
        .bind(&version.version)
        .fetch_optional(&mut *tx)
        .await?;
        if duplicate.is_some() {
            return Err(Error::AlreadyExists(format!(
                "version '{}' already exists for workflow '{name}'",
                version.version
            )));
        }

        insert_version(&mut tx, workflow_id, &version).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, project: &str, name: &str) -> Result<(Workflow, Vec<WorkflowVersion>)> {
        let row: Option<(uuid::Uuid, String)> = sqlx::query_as(
            "SELECT id, owner FROM workflows WHERE project = $1 AND name = $2",
        )
        .bind(project)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        let (workflow_id, owner) =
            row.ok_or_else(|| Error::NotFound(format!("workflow '{name}' not found")))?;

        let rows: Vec<VersionRow> = sqlx::query_as(
            "SELECT version, image_digest, graphs, inputs_schema FROM workflow_versions \
             WHERE workflow_id = $1 ORDER BY created_at",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        let versions = rows
            .into_iter()
            .map(|r| -> Result<WorkflowVersion> {
                Ok(WorkflowVersion {
                    workflow_name: name.to_string(),
                    version: r.version,
                    image_digest: r.image_digest,
                    graphs: serde_json::from_value(r.graphs)?,
                    inputs_schema: r.inputs_schema,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((
            Workflow {
                project: project.to_string(),
                name: name.to_string(),
                owner,
            },
            versions,
        ))
    }

    pub async fn list(&self, project: &str) -> Result<Vec<Workflow>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT name, owner FROM workflows WHERE project = $1 ORDER BY created_at",
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, owner)| Workflow {
                project: project.to_string(),
                name,
                owner,
            })
            .collect())
    }

    /// Resolve a `workflow_ref` (§4.4 step 1): `version` defaults to the most
    /// recently created, `graph` must be one of the declared graphs.
    pub async fn resolve(
        &self,
        project: &str,
        name: &str,
        version: Option<&str>,
        graph: &str,
    ) -> Result<WorkflowVersion> {
        let (_workflow, versions) = self.get(project, name).await?;
        let resolved = match version {
            Some(v) => versions
                .into_iter()
                .find(|wv| wv.version == v)
                .ok_or_else(|| Error::NotFound(format!("version '{v}' not found")))?,
            None => versions
                .into_iter()
                .last()
                .ok_or_else(|| Error::NotFound(format!("workflow '{name}' has no versions")))?,
        };

        if !resolved.graphs.iter().any(|g| g.name == graph) {
            return Err(Error::InvalidGraphRef(format!(
                "graph '{graph}' is not declared by {name}@{}",
                resolved.version
            )));
        }
        Ok(resolved)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, project: &str, name: &str) -> Result<()> {
        let non_terminal: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM runs WHERE project = $1 AND workflow_name = $2 \
             AND phase NOT IN ('Completed', 'Failed', 'Stopped', 'Error') LIMIT 1",
        )
        .bind(project)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        if non_terminal.is_some() {
            return Err(Error::InUse(format!(
                "workflow '{name}' has non-terminal runs"
            )));
        }

        let deleted = sqlx::query("DELETE FROM workflows WHERE project = $1 AND name = $2")
            .bind(project)
            .bind(name)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(Error::NotFound(format!("workflow '{name}' not found")));
        }
        Ok(())
    }

    fn validate_version(&self, version: &WorkflowVersion) -> Result<()> {
        validate_digest(&version.image_digest)?;
        if !matches_allow_list(&version.image_digest, &self.allowed_registries) {
            return Err(Error::InvalidImage(format!(
                "'{}' does not match any allowed registry pattern",
                version.image_digest
            )));
        }
        if version.graphs.is_empty() {
            return Err(Error::InvalidGraphRef(
                "a workflow version must declare at least one graph".to_string(),
            ));
        }
        for graph in &version.graphs {
            graph.validate()?;
        }
        if let Some(schema) = &version.inputs_schema {
            validate_json_schema_shape(schema)?;
        }
        Ok(())
    }
}

async fn insert_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    workflow_id: uuid::Uuid,
    version: &WorkflowVersion,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO workflow_versions (workflow_id, version, image_digest, graphs, inputs_schema) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(workflow_id)
    .bind(&version.version)
    .bind(&version.image_digest)
    .bind(serde_json::to_value(&version.graphs)?)
    .bind(&version.inputs_schema)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Best-effort structural check that `schema` is itself a valid JSON Schema
/// document, independent of any instance it will later validate (§4.1).
fn validate_json_schema_shape(schema: &JsonValue) -> Result<()> {
    jsonschema::validator_for(schema)
        .map(|_| ())
        .map_err(|e| Error::InvalidSchema(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_schema_document() {
        let bogus = serde_json::json!({"type": "not-a-real-type"});
        assert!(validate_json_schema_shape(&bogus).is_err());
    }

    #[test]
    fn accepts_well_formed_schema() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"message": {"type": "string"}},
            "required": ["message"]
        });
        assert!(validate_json_schema_shape(&schema).is_ok());
    }
}
