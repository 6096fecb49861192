//! HTTP API (§6.1) — workflow registry CRUD, run lifecycle, event
//! ingress/egress, and approval. Mounted by `src/bin/orchestrator.rs`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::approval::{ApprovalController, Decision};
use crate::error::{Error, Result};
use crate::gateway::{ws as gateway_ws, EventGateway};
use crate::gateway::ws::RunnerIngressState;
use crate::identity::{extract_bearer, IdentityBroker};
use crate::registry::{Registry, WorkflowVersion};
use crate::scheduler::{CreateRunRequest, Scheduler};
use crate::store::{EventEnvelope, Run, RunStore, StatusPatch, Workflow};

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub store: RunStore,
    pub scheduler: Arc<Scheduler>,
    pub gateway: Arc<EventGateway>,
    pub approval: Arc<ApprovalController>,
    pub identity: Arc<IdentityBroker>,
    pub backend_event_url: String,
    pub ws_base_url: String,
    pub credential_secret_prefix: String,
}

/// The identity header this deployment's outer auth gateway is expected to
/// set once it has authenticated the caller (out of scope here; §4.2
/// documents the broker's inputs as "a caller bearer token and/or forwarded
/// identity headers" — this crate consumes the latter).
const CALLER_IDENTITY_HEADER: &str = "x-forwarded-user";

fn caller_identity(headers: &HeaderMap) -> Result<String> {
    headers
        .get(CALLER_IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(Error::Unauthenticated)
}

/// Builds the full router. CORS is intentionally omitted (Non-goal); tracing
/// and a request timeout are ambient regardless, matching the teacher's own
/// `input_bridge` service wiring. The runner's ingress WebSocket is mounted
/// as its own sub-router since it only needs the store, identity broker, and
/// gateway to authenticate the RunnerCredential, not the full state.
pub fn router(state: AppState) -> Router {
    let runner_ws = Router::new()
        .route(
            "/internal/projects/:project/runs/:name/runner-ws",
            get(gateway_ws::runner_ws_handler),
        )
        .with_state(RunnerIngressState {
            store: state.store.clone(),
            identity: state.identity.clone(),
            gateway: state.gateway.clone(),
        });

    Router::new()
        .route(
            "/projects/:project/workflows",
            get(list_workflows).post(register_workflow),
        )
        .route(
            "/projects/:project/workflows/:name",
            get(get_workflow).delete(delete_workflow),
        )
        .route(
            "/projects/:project/workflows/:name/versions",
            post(add_workflow_version),
        )
        .route("/projects/:project/runs", get(list_runs).post(create_run))
        .route(
            "/projects/:project/runs/:id",
            get(get_run).delete(delete_run),
        )
        .route("/projects/:project/runs/:id/stop", post(stop_run))
        .route("/projects/:project/runs/:id/status", put(put_run_status))
        .route(
            "/projects/:project/runs/:id/events",
            get(list_run_events).post(post_run_event),
        )
        .route("/projects/:project/runs/:id/ws", get(subscribe_run_ws))
        .route("/projects/:project/runs/:id/approve", post(approve_run))
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(runner_ws)
}

#[derive(Deserialize)]
struct VersionBody {
    version: String,
    image_digest: String,
    graphs: Vec<crate::registry::GraphRef>,
    inputs_schema: Option<serde_json::Value>,
}

fn into_version(workflow_name: &str, body: VersionBody) -> WorkflowVersion {
    WorkflowVersion {
        workflow_name: workflow_name.to_string(),
        version: body.version,
        image_digest: body.image_digest,
        graphs: body.graphs,
        inputs_schema: body.inputs_schema,
    }
}

#[instrument(skip_all, fields(project = %project))]
async fn register_workflow(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Json(req): Json<RegisterWorkflowRequestWithName>,
) -> Result<Json<Workflow>> {
    let version = into_version(&req.name, req.version);
    let workflow = state
        .registry
        .register_workflow(&project, &req.name, &req.owner, version)
        .await?;
    Ok(Json(workflow))
}

/// The registry keys workflows by `(project, name)`; `name` travels in the
/// request body on creation since the collection route has no `{name}`
/// segment yet.
#[derive(Deserialize)]
struct RegisterWorkflowRequestWithName {
    name: String,
    owner: String,
    #[serde(flatten)]
    version: VersionBody,
}

async fn list_workflows(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Result<Json<Vec<Workflow>>> {
    Ok(Json(state.registry.list(&project).await?))
}

#[derive(Serialize)]
struct WorkflowDetail {
    #[serde(flatten)]
    workflow: Workflow,
    versions: Vec<WorkflowVersion>,
}

async fn get_workflow(
    State(state): State<AppState>,
    Path((project, name)): Path<(String, String)>,
) -> Result<Json<WorkflowDetail>> {
    let (workflow, versions) = state.registry.get(&project, &name).await?;
    Ok(Json(WorkflowDetail { workflow, versions }))
}

async fn add_workflow_version(
    State(state): State<AppState>,
    Path((project, name)): Path<(String, String)>,
    Json(body): Json<VersionBody>,
) -> Result<StatusCode> {
    let version = into_version(&name, body);
    state.registry.add_version(&project, &name, version).await?;
    Ok(StatusCode::CREATED)
}

async fn delete_workflow(
    State(state): State<AppState>,
    Path((project, name)): Path<(String, String)>,
) -> Result<StatusCode> {
    state.registry.delete(&project, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CreateRunBody {
    name: String,
    workflow_name: String,
    version: Option<String>,
    graph: String,
    #[serde(default)]
    inputs: serde_json::Value,
    display_name: Option<String>,
    parent_run: Option<String>,
}

/// Creates a run (§4.4). The `{id}` the caller later addresses it by is the
/// run's `name`, not a server-minted id: the Run Store has no separate run
/// id route key, it addresses runs by `(project, name)` directly, and the
/// UUID in `Run::id` is exposed only as a stable handle for the event log
/// and WebSocket subscriptions.
#[instrument(skip_all, fields(project = %project))]
async fn create_run(
    State(state): State<AppState>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateRunBody>,
) -> Result<Json<Run>> {
    let caller = caller_identity(&headers)?;
    let caller_client = state.identity.impersonating_client(&caller)?;

    let req = CreateRunRequest {
        project: project.clone(),
        name: body.name,
        workflow_name: body.workflow_name,
        version: body.version,
        graph: body.graph,
        inputs: body.inputs,
        display_name: body.display_name,
        parent_run: body.parent_run,
        backend_event_url: state.backend_event_url.clone(),
        ws_url: state.ws_base_url.clone(),
        credential_secret_prefix: state.credential_secret_prefix.clone(),
    };
    let run = state
        .scheduler
        .create_run(&state.store, &state.registry, &caller_client, req)
        .await?;
    Ok(Json(run))
}

async fn list_runs(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Result<Json<Vec<Run>>> {
    Ok(Json(state.store.list_runs(&project).await?))
}

async fn get_run(
    State(state): State<AppState>,
    Path((project, name)): Path<(String, String)>,
) -> Result<Json<Run>> {
    Ok(Json(state.store.get_run(&project, &name).await?))
}

/// Deletes a run's underlying Job. This does not erase the run's row or
/// event history — the Reconciler observes the Job's absence on its next
/// pass and runs the same cascade cleanup it uses for any other deleted Job
/// (§4.5), so there is exactly one cleanup path regardless of who triggered
/// the deletion. `stop_run` below is the same operation under the
/// lifecycle-appropriate verb.
#[instrument(skip_all, fields(project = %project, name = %name))]
async fn delete_run(
    State(state): State<AppState>,
    Path((project, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let caller = caller_identity(&headers)?;
    let client = state.identity.impersonating_client(&caller)?;
    delete_run_job(&state, &client, &project, &name).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_run(
    State(state): State<AppState>,
    Path((project, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let caller = caller_identity(&headers)?;
    let client = state.identity.impersonating_client(&caller)?;

    let run = state.store.get_run(&project, &name).await?;
    if run.status.phase.is_terminal() {
        return Err(Error::Conflict(format!(
            "run '{name}' is already in a terminal phase"
        )));
    }
    state
        .store
        .update_status(
            &project,
            &name,
            StatusPatch {
                phase: Some(crate::store::Phase::Stopped),
                force: true,
                ..Default::default()
            },
        )
        .await?;
    delete_run_job(&state, &client, &project, &name).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Deletes the run's Job using `client`, an impersonating client scoped to
/// the caller who requested the delete/stop (§4.2: never the service-account
/// identity for an object-scoped write a user could not perform directly).
async fn delete_run_job(
    state: &AppState,
    client: &kube::Client,
    project: &str,
    name: &str,
) -> Result<()> {
    let run = state.store.get_run(project, name).await?;
    let Some(job_name) = run.status.job_name else {
        return Ok(());
    };
    use k8s_openapi::api::batch::v1::Job;
    use kube::api::{Api, DeleteParams, PropagationPolicy};
    let jobs: Api<Job> = Api::namespaced(client.clone(), project);
    let params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    };
    match jobs.delete(&job_name, &params).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

/// Verifies the caller presented the RunnerCredential bearer token bound to
/// this run (§4.2, §4.8 allow-list) before a runner-only write proceeds.
async fn verify_runner_bearer(
    state: &AppState,
    project: &str,
    run: &Run,
    headers: &HeaderMap,
) -> Result<()> {
    let secret_name = run
        .status
        .credential_secret
        .as_deref()
        .ok_or(Error::Unauthenticated)?;
    let token = extract_bearer(headers)?;
    state
        .identity
        .verify_runner_credential(project, secret_name, &token)
        .await
}

/// Runner-only status write (§4.8 allow-list).
async fn put_run_status(
    State(state): State<AppState>,
    Path((project, name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(patch): Json<StatusPatch>,
) -> Result<Json<crate::store::RunStatus>> {
    let run = state.store.get_run(&project, &name).await?;
    verify_runner_bearer(&state, &project, &run, &headers).await?;
    Ok(Json(state.store.update_status(&project, &name, patch).await?))
}

#[derive(Deserialize)]
struct EventsQuery {
    since: Option<i64>,
}

async fn list_run_events(
    State(state): State<AppState>,
    Path((project, name)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventEnvelope>>> {
    let run = state.store.get_run(&project, &name).await?;
    Ok(Json(state.store.list_events(run.id, query.since).await?))
}

/// HTTP fallback for runner event ingestion, alongside the runner's
/// dedicated ingress WebSocket (§4.6 ingress accepts either transport).
#[instrument(skip_all, fields(project = %project, name = %name))]
async fn post_run_event(
    State(state): State<AppState>,
    Path((project, name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(event): Json<EventEnvelope>,
) -> Result<StatusCode> {
    let run = state.store.get_run(&project, &name).await?;
    verify_runner_bearer(&state, &project, &run, &headers).await?;
    state.gateway.verify_run_id(run.id, event.run_id)?;
    state.gateway.ingest(&project, &name, event).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn subscribe_run_ws(
    State(state): State<AppState>,
    Path((project, name)): Path<(String, String)>,
    ws: axum::extract::ws::WebSocketUpgrade,
    query: Query<gateway_ws::SubscribeQuery>,
) -> Result<impl IntoResponse> {
    let run = state.store.get_run(&project, &name).await?;
    Ok(gateway_ws::subscribe_ws_handler(
        ws,
        Path(run.id),
        query,
        State(state.gateway.clone()),
    )
    .await)
}

#[derive(Deserialize)]
struct ApproveBody {
    #[serde(default)]
    values: serde_json::Value,
}

#[instrument(skip_all, fields(project = %project, name = %name))]
async fn approve_run(
    State(state): State<AppState>,
    Path((project, name)): Path<(String, String)>,
    Json(body): Json<ApproveBody>,
) -> Result<StatusCode> {
    state
        .approval
        .approve(&project, &name, Decision { values: body.values })
        .await?;
    Ok(StatusCode::OK)
}
