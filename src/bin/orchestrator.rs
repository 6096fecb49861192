/*
 * 5D Labs Agent Platform - Kubernetes Orchestrator for AI Coding Agents
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Orchestrator entrypoint: wires the Registry, Run Store, Identity Broker,
//! Scheduler, Event Gateway, and Approval Controller, then runs the HTTP
//! API and the Reconciler's watch loop until a shutdown signal arrives.

use std::sync::Arc;

use run_orchestrator::approval::ApprovalController;
use run_orchestrator::config::AppConfig;
use run_orchestrator::gateway::EventGateway;
use run_orchestrator::http::{self, AppState};
use run_orchestrator::identity::IdentityBroker;
use run_orchestrator::reconciler::run_reconciler;
use run_orchestrator::registry::Registry;
use run_orchestrator::scheduler::Scheduler;
use run_orchestrator::store::RunStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,run_orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "starting run lifecycle engine v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = AppConfig::from_env()?;
    let namespace = std::env::var("ORCHESTRATOR_NAMESPACE").unwrap_or_else(|_| "orchestrator".to_string());

    let client = kube::Client::try_default().await?;
    info!("connected to Kubernetes cluster");

    let store = RunStore::connect(&config.database).await?;
    store.migrate().await?;
    info!("run store migrations applied");

    let registry = Registry::new(store.pool().clone(), config.registry.allowed_registries.clone());
    let identity = IdentityBroker::new(client.clone());
    let scheduler = Arc::new(Scheduler::new(client.clone(), identity.clone(), config.run.clone()));
    let gateway = Arc::new(EventGateway::new(store.clone(), config.gateway.event_queue_depth));
    let approval = Arc::new(ApprovalController::new(store.clone(), config.run.resume_timeout));

    let sweeper_handle = store.spawn_checkpoint_sweeper(config.checkpoint.retention);

    let reconciler_handle = {
        let client = client.clone();
        let store = store.clone();
        let identity = identity.clone();
        let config = config.run.clone();
        let namespace = namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = run_reconciler(client, store, identity, config, namespace).await {
                tracing::error!(error = %e, "reconciler loop exited");
            }
        })
    };

    let state = AppState {
        registry,
        store,
        scheduler,
        gateway,
        approval,
        identity: Arc::new(identity),
        backend_event_url: config.run.backend_event_url.clone(),
        ws_base_url: config.run.ws_base_url.clone(),
        credential_secret_prefix: config.run.credential_secret_prefix.clone(),
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("HTTP API listening on 0.0.0.0:8080");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reconciler_handle.abort();
    sweeper_handle.abort();
    info!("run lifecycle engine stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
