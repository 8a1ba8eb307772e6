mod handlers;
mod models;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::jobs::queue::QueueClient;
use crate::jobs::repo::JobRepo;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repo: JobRepo,
    pub queue: QueueClient,
}

/// Build the complete API router.
pub fn router(config: Arc<Config>, repo: JobRepo, queue: QueueClient) -> Router {
    let state = AppState {
        config,
        repo,
        queue,
    };

    Router::new()
        .route("/scripts", post(handlers::upload_script))
        .route("/scripts/{id}/run", post(handlers::run_script))
        .route("/jobs/{id}", get(handlers::get_job))
        .route("/jobs/{id}/logs", get(handlers::get_job_logs))
        .route("/healthz", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::{self, RunScriptPayload, TASK_TYPE_RUN_SCRIPT};
    use crate::jobs::{Job, JobStatus};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn test_app() -> (Router, AppState, mpsc::Receiver<queue::Task>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        });
        std::fs::create_dir_all(config.scripts_dir()).unwrap();
        std::fs::create_dir_all(config.logs_dir()).unwrap();

        let repo = JobRepo::connect(&config.db_path()).await.unwrap();
        let (queue, rx) = queue::channel(8);

        let state = AppState {
            config: Arc::clone(&config),
            repo: repo.clone(),
            queue: queue.clone(),
        };
        let app = router(config, repo, queue);
        (app, state, rx, dir)
    }

    fn multipart_body(boundary: &str, file_name: &str, contents: &str) -> Body {
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"script\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\
             {contents}\r\n\
             --{boundary}--\r\n"
        );
        Body::from(body)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_upload_stores_script() {
        let (app, state, _rx, _dir) = test_app().await;

        let boundary = "XBOUNDARY";
        let response = app
            .oneshot(
                Request::post("/scripts")
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(multipart_body(boundary, "hello.sh", "#!/bin/sh\necho hi\n"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let script_id = json["script_id"].as_str().unwrap();

        let stored = state
            .config
            .scripts_dir()
            .join(format!("{}.sh", script_id));
        assert_eq!(
            std::fs::read_to_string(stored).unwrap(),
            "#!/bin/sh\necho hi\n"
        );
    }

    #[tokio::test]
    async fn test_upload_zero_byte_script_succeeds() {
        let (app, _state, _rx, _dir) = test_app().await;

        let boundary = "XBOUNDARY";
        let response = app
            .oneshot(
                Request::post("/scripts")
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(multipart_body(boundary, "empty.sh", ""))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upload_without_script_field_is_rejected() {
        let (app, _state, _rx, _dir) = test_app().await;

        let boundary = "XBOUNDARY";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"other\"\r\n\r\n\
             data\r\n\
             --{boundary}--\r\n"
        );
        let response = app
            .oneshot(
                Request::post("/scripts")
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_run_unknown_script_is_404() {
        let (app, _state, _rx, _dir) = test_app().await;

        let response = app
            .oneshot(
                Request::post("/scripts/unknown/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_inserts_pending_job_then_enqueues() {
        let (app, state, mut rx, _dir) = test_app().await;
        std::fs::write(state.config.scripts_dir().join("s1.sh"), "echo hi").unwrap();

        let response = app
            .oneshot(
                Request::post("/scripts/s1/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let job_id = json["job_id"].as_str().unwrap().to_string();

        // The pending row carries the minted id and the script id.
        let job = state.repo.get(&job_id).await.unwrap();
        assert_eq!(job.script_id, "s1");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.started_at.is_empty());
        assert!(job.finished_at.is_empty());

        // The queued payload reuses the same job id.
        let task = rx.recv().await.unwrap();
        assert_eq!(task.kind, TASK_TYPE_RUN_SCRIPT);
        let payload: RunScriptPayload = serde_json::from_slice(&task.payload).unwrap();
        assert_eq!(payload.job_id, job_id);
        assert_eq!(payload.script_id, "s1");
    }

    #[tokio::test]
    async fn test_run_with_closed_queue_is_500() {
        let (app, state, rx, _dir) = test_app().await;
        std::fs::write(state.config.scripts_dir().join("s1.sh"), "echo hi").unwrap();
        drop(rx);

        let response = app
            .oneshot(
                Request::post("/scripts/s1/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_get_job_roundtrip() {
        let (app, state, _rx, _dir) = test_app().await;
        state
            .repo
            .insert(&Job {
                id: "j-1".into(),
                script_id: "s-1".into(),
                status: JobStatus::Success,
                log_path: "data/logs/j-1.log".into(),
                started_at: "2026-01-01T00:00:00+00:00".into(),
                finished_at: "2026-01-01T00:00:31+00:00".into(),
            })
            .await
            .unwrap();

        let response = app
            .oneshot(Request::get("/jobs/j-1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["id"], "j-1");
        assert_eq!(json["script_id"], "s-1");
        assert_eq!(json["status"], "success");
        assert_eq!(json["log_path"], "data/logs/j-1.log");
        assert!(json["started_at"].as_str().unwrap() <= json["finished_at"].as_str().unwrap());
    }

    #[tokio::test]
    async fn test_get_unknown_job_is_404() {
        let (app, _state, _rx, _dir) = test_app().await;

        let response = app
            .oneshot(Request::get("/jobs/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_logs_returns_plain_text() {
        let (app, state, _rx, _dir) = test_app().await;
        std::fs::write(
            state.config.logs_dir().join("j-1.log"),
            "line\n===== VM CONSOLE OUTPUT =====\nhi\n",
        )
        .unwrap();

        let response = app
            .oneshot(Request::get("/jobs/j-1/logs").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert!(std::str::from_utf8(&bytes).unwrap().contains("hi"));
    }

    #[tokio::test]
    async fn test_get_logs_missing_is_404() {
        let (app, _state, _rx, _dir) = test_app().await;

        let response = app
            .oneshot(
                Request::get("/jobs/ghost/logs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_logs_rejects_traversal() {
        let (app, _state, _rx, _dir) = test_app().await;

        let response = app
            .oneshot(
                Request::get("/jobs/..%2F..%2Fetc%2Fpasswd/logs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _state, _rx, _dir) = test_app().await;

        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["backend"], "firecracker");
    }
}
