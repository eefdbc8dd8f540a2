// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface of the node.
//!
//! - `POST /invoke` (also `POST /`): run a [`WorkflowRequest`]
//! - `GET /stats`: Running instances per function

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use drizzle_protocol::{WorkflowRequest, WorkflowResponse};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::error::Error;
use crate::manager::Manager;
use crate::peer::{FORWARDED_HEADER, TRACEPARENT_HEADER};
use crate::scheduler::FunctionScheduler;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub scheduler: Arc<FunctionScheduler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(invoke))
        .route("/invoke", post(invoke))
        .route("/stats", get(stats))
        .with_state(state)
}

/// HTTP status reported for a failed request.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_definition_error() => StatusCode::BAD_REQUEST,
        Error::NoInstance(_) | Error::NoValidTarget(_) | Error::ResourceLimit(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::InstanceNotService
        | Error::Launch(_)
        | Error::Frame(_)
        | Error::WorkerFailed(_)
        | Error::PeerRequest(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn invoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<WorkflowRequest>,
) -> (StatusCode, Json<WorkflowResponse>) {
    let forwarded = header(&headers, FORWARDED_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let trace_parent = header(&headers, TRACEPARENT_HEADER).map(str::to_string);

    let outcome = state
        .manager
        .invoke_response(request, forwarded, trace_parent)
        .await;
    let status = outcome.error.as_ref().map(status_for).unwrap_or(StatusCode::OK);
    (status, Json(outcome.response))
}

async fn stats(State(state): State<AppState>) -> Json<BTreeMap<String, usize>> {
    Json(state.scheduler.stats().into_iter().collect())
}

/// Serve HTTP on `listener` until `true` is sent on `shutdown_rx`.
pub async fn run_server(
    listener: TcpListener,
    state: AppState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "HTTP server starting");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    info!("HTTP server received shutdown signal");
                    break;
                }
            }
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::LocalControlPlane;
    use crate::engine::Engine;
    use crate::events::{EventSink, QpsRecorder};
    use crate::launcher::MockLauncher;
    use crate::middleware::MiddlewareChain;
    use crate::scheduler::AllowAll;
    use drizzle_dsl::DslError;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::WorkflowNotFound("w".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&Error::FlowNotFound("f".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&DslError::NoEndFound("w".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&Error::NoInstance("A".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&Error::NoValidTarget("A".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&Error::WorkerFailed("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&Error::ControlPlane("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_invoke_and_stats_over_http() {
        let control_plane = Arc::new(LocalControlPlane::new());
        control_plane
            .register(
                serde_json::from_value(json!({
                    "name": "wf",
                    "spec": [{"name": "only", "function": "A", "role": "start"},
                             {"name": "end", "function": "A", "role": "end"}]
                }))
                .unwrap(),
            )
            .unwrap();

        let (sink, _events) = EventSink::channel();
        let (scheduler, _trigger) = FunctionScheduler::new(
            Arc::new(MockLauncher::new()),
            Arc::new(AllowAll),
            Duration::from_secs(20),
            sink.clone(),
        );
        let scheduler = Arc::new(scheduler);
        scheduler.refresh("A", 1).await;
        assert!(
            scheduler
                .get("A")
                .unwrap()
                .function_cold_start_done(Duration::from_secs(5))
                .await
        );

        let chain = MiddlewareChain::new(
            scheduler.clone(),
            sink.clone(),
            Arc::new(QpsRecorder::new()),
            Duration::from_millis(20),
        );
        let engine = Engine::new(Arc::new(chain), scheduler.clone(), sink);
        let state = AppState {
            manager: Arc::new(Manager::new(control_plane, engine)),
            scheduler: scheduler.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(run_server(listener, state, shutdown_rx));

        let client = reqwest::Client::new();
        let ok = client
            .post(format!("http://{addr}/invoke"))
            .json(&json!({"workflowName": "wf", "parameters": {"a": 1}}))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);
        let body: WorkflowResponse = ok.json().await.unwrap();
        assert!(body.success);
        assert_eq!(body.result, json!({"a": 1, "A": "A"}));

        let missing = client
            .post(format!("http://{addr}/"))
            .json(&json!({"workflowName": "nope"}))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
        let body: WorkflowResponse = missing.json().await.unwrap();
        assert!(!body.success);
        assert!(body.message.contains("nope"));

        let stats: BTreeMap<String, usize> = client
            .get(format!("http://{addr}/stats"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["A"], 1);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
        scheduler.shutdown().await;
    }
}
