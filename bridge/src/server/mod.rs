// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::health::HealthSignal;
use crate::watcher::WatcherState;
use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{error, info};

pub const HEALTH_PATH: &str = "/health";
pub const STATUS_PATH: &str = "/status";
pub const METRICS_PATH: &str = "/metrics";

#[derive(Clone)]
pub struct ServerState {
    pub health: HealthSignal,
    pub watcher_state: watch::Receiver<WatcherState>,
    pub registry: Registry,
}

#[derive(Debug, PartialEq, Eq, serde::Serialize)]
pub struct StatusResponse {
    pub state: WatcherState,
    pub healthy: bool,
}

/// Binds `socket_address` and serves the health and metrics endpoints in the
/// background.
pub async fn run_server(
    socket_address: SocketAddr,
    state: ServerState,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(socket_address)
        .await
        .with_context(|| format!("failed to bind {}", socket_address))?;
    info!("Serving health and metrics on {}", socket_address);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, make_router(state).into_make_service()).await {
            error!("Health and metrics server stopped: {}", e);
        }
    }))
}

pub(crate) fn make_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(HEALTH_PATH, get(health_check))
        .route(STATUS_PATH, get(status))
        .route(METRICS_PATH, get(metrics_exposition))
        .with_state(state)
}

async fn health_check(State(state): State<ServerState>) -> StatusCode {
    if state.health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status(State(state): State<ServerState>) -> Json<StatusResponse> {
    let watcher_state = *state.watcher_state.borrow();
    Json(StatusResponse {
        state: watcher_state,
        healthy: state.health.is_healthy(),
    })
}

async fn metrics_exposition(State(state): State<ServerState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&state.registry.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}
