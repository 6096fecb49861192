//! WebSocket endpoints for the Event Gateway (§4.6): the runner's ingress
//! socket and a UI's egress (subscribe) socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identity::{extract_bearer, redact_bearer, IdentityBroker};
use crate::store::{EventEnvelope, RunStore};

use super::EventGateway;

/// State for the runner's ingress WebSocket route, a narrower slice of
/// `http::AppState` — the runner-ws route needs the store and identity
/// broker to authenticate the RunnerCredential, but nothing else.
#[derive(Clone)]
pub struct RunnerIngressState {
    pub store: RunStore,
    pub identity: Arc<IdentityBroker>,
    pub gateway: Arc<EventGateway>,
}

#[derive(Deserialize)]
pub struct SubscribeQuery {
    #[serde(default)]
    since_seq: Option<i64>,
    #[serde(default = "default_true")]
    include_partial_messages: bool,
}

fn default_true() -> bool {
    true
}

/// The runner's ingress socket: each inbound frame is one JSON event
/// envelope (§4.6 ingress). The bearer token is checked against the run's
/// live RunnerCredential Secret before the upgrade is accepted.
pub async fn runner_ws_handler(
    ws: WebSocketUpgrade,
    Path((project, name)): Path<(String, String)>,
    headers: HeaderMap,
    State(state): State<RunnerIngressState>,
) -> Result<impl IntoResponse> {
    let run = state.store.get_run(&project, &name).await?;
    let secret_name = run.status.credential_secret.ok_or(Error::Unauthenticated)?;
    let token = extract_bearer(&headers)?;
    state
        .identity
        .verify_runner_credential(&project, &secret_name, &token)
        .await?;

    let gateway = state.gateway.clone();
    Ok(ws.on_upgrade(move |socket| handle_runner_socket(socket, gateway, project, name)))
}

async fn handle_runner_socket(mut socket: WebSocket, gateway: Arc<EventGateway>, project: String, name: String) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else { continue };
        let event: EventEnvelope = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!(project, name, error = %e, "dropped malformed event frame");
                continue;
            }
        };
        if let Err(e) = gateway.ingest(&project, &name, event).await {
            warn!(project, name, error = %e, "failed to ingest runner event");
        }
    }
    debug!(project, name, "runner socket closed");
}

/// A UI's egress socket: replays backfill from `since_seq`, then tails live
/// events until the client disconnects (§4.6 egress, §5 ordering).
pub async fn subscribe_ws_handler(
    ws: WebSocketUpgrade,
    Path(run_id): Path<uuid::Uuid>,
    Query(query): Query<SubscribeQuery>,
    State(gateway): State<Arc<EventGateway>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscriber_socket(socket, gateway, run_id, query))
}

async fn handle_subscriber_socket(
    mut socket: WebSocket,
    gateway: Arc<EventGateway>,
    run_id: uuid::Uuid,
    query: SubscribeQuery,
) {
    let (backfill, subscriber_id, mut rx) = match gateway
        .subscribe(run_id, query.since_seq, query.include_partial_messages)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "subscribe failed");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    for event in backfill {
        if send_event(&mut socket, &event).await.is_err() {
            gateway.unsubscribe(run_id, subscriber_id);
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = socket
                            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                                code: super::hub::SLOW_CONSUMER_CLOSE_CODE,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(run_id = %run_id, error = %e, "subscriber socket read error");
                        break;
                    }
                }
            }
        }
    }

    gateway.unsubscribe(run_id, subscriber_id);
}

async fn send_event(socket: &mut WebSocket, event: &EventEnvelope) -> Result<(), axum::Error> {
    let body = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(body)).await
}

/// Masks a runner's bearer token before it is ever written to a log line
/// from this module (kept here so call sites importing `gateway::ws` don't
/// need a separate import for the one log statement that handles auth
/// failures upstream of the upgrade).
pub fn log_safe_authorization_header(header_value: &str) -> String {
    redact_bearer(header_value)
}
