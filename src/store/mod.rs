//! Run Store (§4.3) — the single transactional store backing runs, their
//! append-only event log, and checkpoints.

pub mod checkpoints;
pub mod events;
pub mod models;
pub mod runs;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::Result;

pub use models::{Checkpoint, EventEnvelope, NewRun, Phase, Run, RunStatus, StatusPatch, WorkflowRef};

#[derive(Clone)]
pub struct RunStore {
    pool: PgPool,
}

impl RunStore {
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(config.statement_timeout)
            .connect(&config.url)
            .await?;
        info!("connected to run store database");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Internal(anyhow::anyhow!(e)))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create_run(&self, run: NewRun) -> Result<Run> {
        runs::create_run(&self.pool, run).await
    }

    pub async fn get_run(&self, project: &str, name: &str) -> Result<Run> {
        runs::get_run(&self.pool, project, name).await
    }

    pub async fn list_runs(&self, project: &str) -> Result<Vec<Run>> {
        runs::list_runs(&self.pool, project).await
    }

    pub async fn update_status(
        &self,
        project: &str,
        name: &str,
        patch: StatusPatch,
    ) -> Result<RunStatus> {
        runs::update_status(&self.pool, project, name, patch).await
    }

    pub async fn append_event(&self, event: &EventEnvelope) -> Result<()> {
        events::append_event(&self.pool, event).await
    }

    pub async fn list_events(
        &self,
        run_id: uuid::Uuid,
        since_seq: Option<i64>,
    ) -> Result<Vec<EventEnvelope>> {
        events::list_events(&self.pool, run_id, since_seq).await
    }

    pub async fn next_event_seq(&self, run_id: uuid::Uuid) -> Result<i64> {
        events::next_seq(&self.pool, run_id).await
    }

    pub async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoints::put_checkpoint(&self.pool, checkpoint).await
    }

    pub async fn get_checkpoint(&self, thread_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        checkpoints::get_checkpoint(&self.pool, thread_id, checkpoint_id).await
    }

    pub async fn sweep_expired_checkpoints(&self, retention: Duration) -> Result<u64> {
        checkpoints::sweep_expired_checkpoints(&self.pool, retention).await
    }

    /// Spawns the periodic retention sweep (SPEC_FULL §4.3 supplement). The
    /// returned handle is aborted on shutdown by the caller.
    pub fn spawn_checkpoint_sweeper(&self, retention: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                if let Err(e) = store.sweep_expired_checkpoints(retention).await {
                    tracing::warn!(error = %e, "checkpoint retention sweep failed");
                }
            }
        })
    }
}
