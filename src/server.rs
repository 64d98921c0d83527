//! HTTP/JSON transport for the coordinator

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::{Coordinator, ProgressRetryRequest, RunRequest, SubmitRequest};
use crate::report::ExecutionReport;

type Reply = (StatusCode, Json<ExecutionReport>);

fn reply(report: ExecutionReport) -> Reply {
    let status =
        StatusCode::from_u16(report.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(report))
}

fn malformed(rejection: JsonRejection) -> Reply {
    warn!("Malformed request body: {}", rejection.body_text());
    reply(ExecutionReport::rejected(
        Uuid::new_v4(),
        "Malformed request body",
    ))
}

async fn submit(
    State(coordinator): State<Arc<Coordinator>>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Reply {
    match payload {
        Ok(Json(request)) => reply(coordinator.submit_code(request).await),
        Err(rejection) => malformed(rejection),
    }
}

async fn run(
    State(coordinator): State<Arc<Coordinator>>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Reply {
    match payload {
        Ok(Json(request)) => reply(coordinator.run_code(request).await),
        Err(rejection) => malformed(rejection),
    }
}

async fn retry_progress(
    State(coordinator): State<Arc<Coordinator>>,
    payload: Result<Json<ProgressRetryRequest>, JsonRejection>,
) -> Reply {
    match payload {
        Ok(Json(request)) => reply(coordinator.retry_progress(request).await),
        Err(rejection) => malformed(rejection),
    }
}

async fn health(State(coordinator): State<Arc<Coordinator>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "isolation": coordinator.is_isolated(),
    }))
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/submit", post(submit))
        .route("/api/run", post(run))
        .route("/api/progress/retry", post(retry_progress))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

/// Serve until Ctrl-C
pub async fn serve(bind_addr: &str, coordinator: Arc<Coordinator>) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await
        .context("HTTP server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::CurriculumDocument;
    use crate::languages::{LanguageConfig, LanguageRegistry};
    use crate::normalizer::Normalizer;
    use crate::progress::InMemoryProgress;
    use crate::report::Outcome;
    use crate::runner::{RunLimits, SandboxedRunner};
    use crate::sandbox::SandboxConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> Router {
        let mut languages = LanguageRegistry::embedded().unwrap();
        languages.insert("sh", LanguageConfig::new("main.sh", "sh main.sh"));
        let curriculum = CurriculumDocument::from_json(
            r#"{"belts": [{"name": "White", "startDay": 1, "endDay": 2, "days": [
                {"day": 1, "exercise": {"test_cases": [{"expected_output": "Hello, World!"}]}}
            ]}]}"#,
        )
        .unwrap();
        let coordinator = Coordinator::new(
            Normalizer::new(languages),
            Arc::new(SandboxedRunner::new(SandboxConfig::default()).await.unwrap()),
            Arc::new(curriculum),
            Arc::new(InMemoryProgress::new()),
            RunLimits::new(500, 0),
        );
        router(Arc::new(coordinator))
    }

    async fn post_json(app: Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["isolation"].is_boolean());
    }

    #[tokio::test]
    async fn test_submit_success() {
        let (status, json) = post_json(
            app().await,
            "/api/submit",
            r#"{"code": "echo 'Hello, World!'", "lesson_id": 1, "user_id": "ada", "language": "sh"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["next_lesson_id"], 2);
        assert_eq!(json["progress_recorded"], true);
    }

    #[tokio::test]
    async fn test_missing_code_is_bad_request() {
        let (status, json) =
            post_json(app().await, "/api/submit", r#"{"lesson_id": 1, "user_id": "ada"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["message"], "No code provided");
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (status, json) = post_json(app().await, "/api/run", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["outcome"], Outcome::Rejected.to_string());
    }

    #[tokio::test]
    async fn test_unknown_lesson_is_not_found() {
        let (status, _) = post_json(
            app().await,
            "/api/submit",
            r#"{"code": "echo hi", "lesson_id": 9, "user_id": "ada", "language": "sh"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_timeout_is_request_timeout() {
        let (status, json) = post_json(
            app().await,
            "/api/run",
            r#"{"code": "while :; do :; done", "language": "sh"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(json["outcome"], "timeout");
    }

    #[tokio::test]
    async fn test_unknown_retry_is_not_found() {
        let body = format!(r#"{{"submission_id": "{}"}}"#, Uuid::new_v4());
        let (status, json) = post_json(app().await, "/api/progress/retry", &body).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["outcome"], "rejected");
    }
}
