//! Approval Controller (§4.7) — resumes a run awaiting input by POSTing the
//! decision to the runner's per-run Service, serialized per run.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client as HttpClient;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::scheduler::naming::ResourceNaming;
use crate::store::{RunStore, StatusPatch};

/// Per-run single-flight guard: concurrent `approve` calls for the same run
/// serialize on this lock, so all but one caller observes `conflict`.
/// Grounded on the teacher's own `DashMap<String, _>` cache-of-locks idiom
/// rather than a cluster-wide `Lease`, since approvals are a single-process
/// concern here.
pub struct ApprovalController {
    http: HttpClient,
    store: RunStore,
    locks: DashMap<String, Arc<Mutex<()>>>,
    resume_timeout: Duration,
}

pub struct Decision {
    pub values: serde_json::Value,
}

impl ApprovalController {
    pub fn new(store: RunStore, resume_timeout: Duration) -> Self {
        Self {
            http: HttpClient::new(),
            store,
            locks: DashMap::new(),
            resume_timeout,
        }
    }

    /// §4.7 algorithm. `project`/`run_name` identify the run; a lock keyed on
    /// `project/run_name` ensures only one approval is in flight at a time.
    #[instrument(skip(self, decision))]
    pub async fn approve(
        &self,
        project: &str,
        run_name: &str,
        decision: Decision,
    ) -> Result<()> {
        let lock_key = format!("{project}/{run_name}");
        let lock = self
            .locks
            .entry(lock_key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock.try_lock();
        let _guard = match guard {
            Ok(guard) => guard,
            Err(_) => {
                return Err(Error::Conflict(format!(
                    "an approval is already in flight for run '{run_name}'"
                )))
            }
        };

        self.approve_locked(project, run_name, decision).await
    }

    async fn approve_locked(&self, project: &str, run_name: &str, decision: Decision) -> Result<()> {
        let run = self.store.get_run(project, run_name).await?;

        let checkpoint_id = run
            .status
            .checkpoint_id
            .clone()
            .ok_or_else(|| Error::Conflict("run has no checkpoint to resume from".to_string()))?;

        let service_name = run
            .status
            .service_name
            .clone()
            .unwrap_or_else(|| ResourceNaming::service_name(run_name));
        let resume_url = format!("http://{service_name}.{project}.svc/resume");

        if let Err(e) =
            send_resume_request(&self.http, self.resume_timeout, &resume_url, &checkpoint_id, &decision.values)
                .await
        {
            warn!(run = run_name, error = %e, "resume rejected by runner");
            return Err(e);
        }

        self.store
            .update_status(
                project,
                run_name,
                StatusPatch {
                    awaiting_approval: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        info!(run = run_name, "approval resumed run");
        Ok(())
    }
}

/// Posts the resume decision to the runner's `/resume` endpoint (§4.7 step 3).
/// Pulled out of `approve_locked` so it can be exercised against a mock
/// server without a Run Store behind it.
async fn send_resume_request(
    http: &HttpClient,
    timeout: Duration,
    resume_url: &str,
    checkpoint_id: &str,
    values: &serde_json::Value,
) -> Result<()> {
    let body = serde_json::json!({
        "checkpoint_id": checkpoint_id,
        "values": values,
    });

    let response = http
        .post(resume_url)
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::RunnerUnreachable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(Error::RunnerUnreachable(format!(
            "runner rejected resume with status {}",
            response.status()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn decision_struct_carries_arbitrary_json_values() {
        let decision = Decision {
            values: serde_json::json!({"approved": true}),
        };
        assert_eq!(decision.values["approved"], true);
    }

    #[tokio::test]
    async fn send_resume_request_succeeds_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resume"))
            .and(body_json(serde_json::json!({
                "checkpoint_id": "ckpt-1",
                "values": {"approved": true},
            })))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let http = HttpClient::new();
        let result = send_resume_request(
            &http,
            Duration::from_secs(5),
            &format!("{}/resume", server.uri()),
            "ckpt-1",
            &serde_json::json!({"approved": true}),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn send_resume_request_surfaces_non_2xx_as_runner_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resume"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let http = HttpClient::new();
        let result = send_resume_request(
            &http,
            Duration::from_secs(5),
            &format!("{}/resume", server.uri()),
            "ckpt-1",
            &serde_json::json!({}),
        )
        .await;
        assert!(matches!(result, Err(Error::RunnerUnreachable(_))));
    }
}
