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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Run lifecycle engine core library.
//!
//! Multi-tenant orchestration service for running agentic workflows as
//! Kubernetes jobs: a Registry of versioned workflow definitions, an
//! Identity Broker for per-run credentials, a Postgres-backed Run Store, a
//! Scheduler that provisions Job/Service/Secret resources, a Reconciler
//! watching those Jobs to completion, an Event Gateway streaming runner
//! output to subscribers, and an Approval Controller resuming runs awaiting
//! input.

pub mod approval;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod identity;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod status_guard;
pub mod store;
