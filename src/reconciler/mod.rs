//! Reconciler (§4.5) — watches `Job`/`Pod` to converge a run's terminal
//! phase and clean up its Kubernetes resources, deferring to any phase the
//! runner has already written itself.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{DeleteParams, ListParams, PropagationPolicy};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use tracing::{error, info, instrument, warn};

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::identity::IdentityBroker;
use crate::scheduler::naming::ResourceNaming;
use crate::status_guard::truncate_to_bytes;
use crate::store::{Phase, RunStore, StatusPatch};

const TERMINATION_MESSAGE_MAX_BYTES: usize = 2 * 1024;
const RESYNC_INTERVAL: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

struct ReconcilerContext {
    client: Client,
    store: RunStore,
    identity: IdentityBroker,
    config: RunConfig,
}

/// Starts the `Controller<Job>` watch loop for `namespace` and runs it to
/// completion (i.e. forever, absent a fatal watch setup error).
#[instrument(skip(client, store, identity, config), fields(namespace = %namespace))]
pub async fn run_reconciler(
    client: Client,
    store: RunStore,
    identity: IdentityBroker,
    config: RunConfig,
    namespace: String,
) -> Result<()> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    let ctx = Arc::new(ReconcilerContext {
        client: client.clone(),
        store,
        identity,
        config,
    });

    Controller::new(jobs, watcher_config.clone())
        .owns(pods, watcher_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                error!(error = ?e, "reconciliation error");
            }
        })
        .await;

    info!("reconciler shutting down");
    Ok(())
}

fn error_policy(_job: Arc<Job>, error: &Error, _ctx: Arc<ReconcilerContext>) -> Action {
    warn!(error = %error, "reconcile failed, retrying with backoff");
    Action::requeue(jittered_backoff())
}

/// 200ms-2s capped backoff with up to 50% jitter (§5 failure containment).
fn jittered_backoff() -> Duration {
    let jitter_millis = (BACKOFF_BASE.as_millis() as u64).max(1);
    let jitter = rand::random::<u64>() % jitter_millis;
    (BACKOFF_BASE + Duration::from_millis(jitter)).min(BACKOFF_CAP)
}

#[instrument(skip(job, ctx), fields(job_name = %job.name_any()))]
async fn reconcile(job: Arc<Job>, ctx: Arc<ReconcilerContext>) -> Result<Action> {
    let labels = job.metadata.labels.clone().unwrap_or_default();
    let (Some(run_name), Some(project)) =
        (labels.get("run-name").cloned(), labels.get("project").cloned())
    else {
        // Not a run-owned Job; ignore.
        return Ok(Action::await_change());
    };

    let run = match ctx.store.get_run(&project, &run_name).await {
        Ok(run) => run,
        Err(Error::NotFound(_)) => {
            return cleanup_deleted_run(&ctx, &project, &run_name, &job).await;
        }
        Err(e) => return Err(e),
    };

    if job.meta().deletion_timestamp.is_some() {
        return cleanup_deleted_run(&ctx, &project, &run_name, &job).await;
    }

    if run.status.phase.is_terminal() {
        schedule_credential_revocation(&ctx, &project, &run.status.credential_secret).await;
        return Ok(Action::await_change());
    }

    let job_name = job.name_any();
    let pods_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &project);
    let pods = pods_api
        .list(&ListParams::default().labels(&format!("job-name={job_name}")))
        .await
        .map_err(Error::Kube)?;

    if let Some(reason) = detect_image_pull_failure(&pods.items) {
        let started_at = run.status.start_time.unwrap_or(run.created_at);
        let elapsed = chrono::Utc::now().signed_duration_since(started_at);
        if elapsed.to_std().unwrap_or_default() >= ctx.config.startup_deadline {
            fail_run(&ctx, &project, &run_name, &reason).await?;
            return Ok(Action::await_change());
        }
        return Ok(Action::requeue(RESYNC_INTERVAL));
    }

    let status = job.status.clone().unwrap_or_default();
    if status.succeeded.unwrap_or(0) > 0 {
        complete_run(&ctx, &project, &run_name).await?;
        return Ok(Action::await_change());
    }

    if status.failed.unwrap_or(0) > 0 {
        let message = pod_termination_message(&pods.items)
            .unwrap_or_else(|| "job failed".to_string());
        fail_run(&ctx, &project, &run_name, &message).await?;
        return Ok(Action::await_change());
    }

    Ok(Action::requeue(RESYNC_INTERVAL))
}

fn detect_image_pull_failure(pods: &[Pod]) -> Option<String> {
    for pod in pods {
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());
        let Some(statuses) = statuses else { continue };
        for cs in statuses {
            if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                if let Some(reason) = &waiting.reason {
                    if matches!(
                        reason.as_str(),
                        "ImagePullBackOff" | "ErrImagePull" | "CreateContainerConfigError"
                    ) {
                        return Some(reason.clone());
                    }
                }
            }
        }
    }
    None
}

fn pod_termination_message(pods: &[Pod]) -> Option<String> {
    pods.iter().find_map(|pod| {
        let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
        statuses.iter().find_map(|cs| {
            let terminated = cs.state.as_ref()?.terminated.as_ref()?;
            terminated.message.clone()
        })
    })
}

async fn complete_run(ctx: &ReconcilerContext, project: &str, run_name: &str) -> Result<()> {
    ctx.store
        .update_status(
            project,
            run_name,
            StatusPatch {
                phase: Some(Phase::Completed),
                completion_time: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

async fn fail_run(
    ctx: &ReconcilerContext,
    project: &str,
    run_name: &str,
    message: &str,
) -> Result<()> {
    ctx.store
        .update_status(
            project,
            run_name,
            StatusPatch {
                phase: Some(Phase::Failed),
                message: Some(truncate_to_bytes(message, TERMINATION_MESSAGE_MAX_BYTES)),
                is_error: Some(true),
                completion_time: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

/// Run-deletion cascade (§4.5): foreground-delete the Job (Pods follow) and
/// the per-run Service explicitly; the credential Secret and any workspace
/// PVC follow the Job via owner-refs.
async fn cleanup_deleted_run(
    ctx: &ReconcilerContext,
    project: &str,
    run_name: &str,
    job: &Job,
) -> Result<Action> {
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), project);
    let job_name = job.name_any();
    let dp = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    };
    match jobs.delete(&job_name, &dp).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(Error::Kube(e)),
    }

    let service_name = ResourceNaming::service_name(run_name);
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), project);
    match services.delete(&service_name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(Error::Kube(e)),
    }

    info!(run = run_name, "deleted run resources on cascade");
    Ok(Action::await_change())
}

async fn schedule_credential_revocation(
    ctx: &ReconcilerContext,
    project: &str,
    credential_secret: &Option<String>,
) {
    let Some(secret_name) = credential_secret else {
        return;
    };
    if let Err(e) = ctx.identity.revoke_credential(project, secret_name).await {
        warn!(error = %e, secret_name, "failed to revoke credential for terminal run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateWaiting, ContainerStatus};

    fn waiting_pod(reason: &str) -> Pod {
        Pod {
            status: Some(k8s_openapi::api::core::v1::PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some(reason.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn detects_image_pull_backoff() {
        let pods = vec![waiting_pod("ImagePullBackOff")];
        assert_eq!(
            detect_image_pull_failure(&pods),
            Some("ImagePullBackOff".to_string())
        );
    }

    #[test]
    fn ignores_unrelated_waiting_reasons() {
        let pods = vec![waiting_pod("ContainerCreating")];
        assert_eq!(detect_image_pull_failure(&pods), None);
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        for _ in 0..20 {
            assert!(jittered_backoff() <= BACKOFF_CAP);
        }
    }
}
