// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use tracing::{error, info};

pub const HEALTH_PATH: &str = "/health";
pub const METRICS_PATH: &str = "/metrics";

/// Serves the prometheus registry over HTTP until the task is aborted.
pub async fn run_metrics_server(
    socket_address: SocketAddr,
    registry: Registry,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(socket_address).await?;
    info!("Metrics server listening on {}", socket_address);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, make_router(registry)).await {
            error!("Metrics server error: {:?}", e);
        }
    }))
}

pub(crate) fn make_router(registry: Registry) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(HEALTH_PATH, get(health_check))
        .route(METRICS_PATH, get(metrics))
        .with_state(registry)
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(registry): State<Registry>) -> impl IntoResponse {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::BridgeMetrics;

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let registry = Registry::new();
        let metrics = BridgeMetrics::new(&registry);
        metrics.vt_request_event.inc();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, make_router(registry)).await.unwrap();
        });

        let base = format!("http://{}", address);
        let health = reqwest::get(format!("{}{}", base, HEALTH_PATH)).await.unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);
        let body = reqwest::get(format!("{}{}", base, METRICS_PATH))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("vt_request_event 1"));
        server.abort();
    }
}
