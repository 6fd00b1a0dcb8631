//! Driver-facing job API over HTTP, with server-sent progress streams.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use rowsync_sync::{
    build_cron_driver, progress_channel, BatchScheduler, JobRequest, ProgressFrame, ProgressSender,
    SchedulerError, StartOutcome, SyncConfig, DEFAULT_STREAM_CAPACITY,
};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "rowsync-web";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<BatchScheduler>,
    /// Every input and output path in a request resolves under this directory.
    pub data_dir: PathBuf,
    pub stream_capacity: usize,
}

impl AppState {
    pub fn new(scheduler: Arc<BatchScheduler>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            scheduler,
            data_dir: data_dir.into(),
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(config.build_scheduler().await?),
            config.data_dir.clone(),
        ))
    }

    /// Rewrite the request's file paths to live under `data_dir`.
    fn confine(&self, mut request: JobRequest) -> Result<JobRequest> {
        if let Some(path) = request.input_path.take() {
            request.input_path = Some(resolve_data_path(&self.data_dir, &path)?);
        }
        if let Some(path) = request.output_path.take() {
            request.output_path = Some(resolve_data_path(&self.data_dir, &path)?);
        }
        Ok(request)
    }
}

/// `requested` joined onto `root`; only plain relative components are accepted.
pub fn resolve_data_path(root: &Path, requested: &Path) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    let mut depth = 0;
    for component in requested.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!(
                    "{} must be a relative path inside the data directory",
                    requested.display()
                );
            }
        }
    }
    if depth == 0 {
        bail!("{} does not name a file", requested.display());
    }
    Ok(resolved)
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route(
            "/jobs",
            get(job_status_handler)
                .post(start_job_handler)
                .delete(cancel_job_handler),
        )
        .route("/jobs/stream", post(start_job_stream_handler))
        .route("/jobs/next", post(next_job_handler))
        .route("/jobs/next/stream", post(next_job_stream_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> Result<()> {
    serve(&SyncConfig::from_env()).await
}

/// Serve the job API; with a driver cron configured, chunks also advance on schedule.
pub async fn serve(config: &SyncConfig) -> Result<()> {
    let state = AppState::from_config(config).await?;
    let _driver = match &config.driver_cron {
        Some(cron) => {
            let sched = build_cron_driver(cron, state.scheduler.clone()).await?;
            sched.start().await.context("starting driver schedule")?;
            info!(%cron, "scheduled driver running");
            Some(sched)
        }
        None => None,
    };
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "job API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn job_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.current_job().await {
        Ok(job) => Json(json!({ "job": job })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn start_job_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JobRequest>,
) -> Response {
    let request = match state.confine(request) {
        Ok(request) => request,
        Err(err) => return job_error(err, StatusCode::BAD_REQUEST),
    };
    match state.scheduler.start_job(request, ProgressSender::detached()).await {
        Ok(outcome) => Json(start_body(&outcome)).into_response(),
        Err(err) => job_error(err, StatusCode::BAD_REQUEST),
    }
}

async fn start_job_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JobRequest>,
) -> Response {
    let request = match state.confine(request) {
        Ok(request) => request,
        Err(err) => return job_error(err, StatusCode::BAD_REQUEST),
    };
    let (progress, rx) = progress_channel(state.stream_capacity);
    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        if let Err(err) = scheduler.start_job(request, progress).await {
            warn!("streamed job start failed: {err:#}");
        }
    });
    progress_stream(rx).into_response()
}

async fn next_job_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.process_next_job(ProgressSender::detached()).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => job_error(err, StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn next_job_stream_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let (progress, rx) = progress_channel(state.stream_capacity);
    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        if let Err(err) = scheduler.process_next_job(progress).await {
            warn!("streamed chunk failed: {err:#}");
        }
    });
    progress_stream(rx)
}

async fn cancel_job_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.cancel_job().await {
        Ok(job) => Json(json!({
            "cancelled": job.id,
            "completedChunks": job.completed_chunks(),
            "chunks": job.chunks.len(),
        }))
        .into_response(),
        Err(err) => job_error(err, StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn start_body(outcome: &StartOutcome) -> JsonValue {
    match outcome {
        StartOutcome::BatchStarted { job_id, estimate } => json!({
            "batchStarted": true,
            "jobId": job_id,
            "estimate": estimate,
        }),
        StartOutcome::Completed(summary) => json!({
            "batchStarted": false,
            "summary": summary,
        }),
    }
}

/// One SSE event per frame. The body ends once the producer drops its sender,
/// and dropping the body closes the channel, which the producer sees as cancellation.
fn progress_stream(
    rx: mpsc::Receiver<ProgressFrame>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let frames = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });
    Sse::new(frames.map(|frame| Event::default().event(frame.event_name()).json_data(&frame)))
        .keep_alive(KeepAlive::default())
}

fn job_error(err: anyhow::Error, fallback: StatusCode) -> Response {
    let status = match err.downcast_ref::<SchedulerError>() {
        Some(SchedulerError::NoActiveJob) => StatusCode::NOT_FOUND,
        Some(SchedulerError::JobAlreadyActive(_) | SchedulerError::Busy) => StatusCode::CONFLICT,
        Some(SchedulerError::InputChanged { .. } | SchedulerError::TooManyChunks { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        None if fallback.is_server_error() => return server_error(err),
        None => fallback,
    };
    (status, Json(json!({ "error": format!("{err:#}") }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!("request failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("Server error: {err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use rowsync_adapters::InMemoryRemote;
    use rowsync_core::ResourceType;
    use rowsync_storage::MemoryStateStore;
    use rowsync_sync::{SchedulerSettings, Thresholds};
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn write_csv(dir: &Path, rows: usize) -> PathBuf {
        let path = dir.join("companies.csv");
        let mut text = String::from("Name,Source Record ID\n");
        for n in 0..rows {
            text.push_str(&format!("Company {n},crm-{n}\n"));
        }
        std::fs::write(&path, text).unwrap();
        path
    }

    fn test_app(remote: Arc<InMemoryRemote>, threshold: usize, data_dir: &Path) -> Router {
        let settings = SchedulerSettings {
            chunk_size: 2,
            thresholds: Thresholds {
                company: threshold,
                note: threshold,
                entity: threshold,
            },
            ..SchedulerSettings::default()
        };
        let scheduler = BatchScheduler::new(Arc::new(MemoryStateStore::new()), remote, settings);
        app(AppState::new(Arc::new(scheduler), data_dir))
    }

    fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn import_body() -> JsonValue {
        json!({ "jobType": "import", "resource": "company", "inputPath": "companies.csv" })
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(resp: Response) -> JsonValue {
        serde_json::from_str(&body_text(resp).await).unwrap()
    }

    #[tokio::test]
    async fn healthz_answers() {
        let dir = tempdir().expect("tempdir");
        let resp = test_app(Arc::new(InMemoryRemote::new()), 100, dir.path())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "ok");
    }

    #[tokio::test]
    async fn small_job_returns_its_summary() {
        let dir = tempdir().expect("tempdir");
        write_csv(dir.path(), 3);
        let remote = Arc::new(InMemoryRemote::new());

        let resp = test_app(remote.clone(), 100, dir.path())
            .oneshot(post_json("/jobs", import_body()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["batchStarted"], json!(false));
        assert_eq!(body["summary"]["created"], json!(3));
        assert_eq!(remote.count(ResourceType::Company).await, 3);
    }

    #[tokio::test]
    async fn batch_job_lifecycle() {
        let dir = tempdir().expect("tempdir");
        write_csv(dir.path(), 5);
        let app = test_app(Arc::new(InMemoryRemote::new()), 1, dir.path());

        let started = body_json(
            app.clone()
                .oneshot(post_json("/jobs", import_body()))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(started["batchStarted"], json!(true));
        assert_eq!(started["estimate"]["chunks"], json!(3));

        let second = app
            .clone()
            .oneshot(post_json("/jobs", import_body()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let next_request = Request::builder()
            .method("POST")
            .uri("/jobs/next")
            .body(Body::empty())
            .unwrap();
        let next = body_json(app.clone().oneshot(next_request).await.unwrap()).await;
        assert_eq!(next["hasMore"], json!(true));
        assert_eq!(next["chunkSummary"]["created"], json!(2));

        let status = body_json(
            app.clone()
                .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(status["job"]["id"], started["jobId"]);

        let cancel = || {
            Request::builder()
                .method("DELETE")
                .uri("/jobs")
                .body(Body::empty())
                .unwrap()
        };
        let cancelled = app.clone().oneshot(cancel()).await.unwrap();
        assert_eq!(cancelled.status(), StatusCode::OK);
        assert_eq!(body_json(cancelled).await["completedChunks"], json!(1));

        let again = app.oneshot(cancel()).await.unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn streamed_job_ends_with_complete_frame() {
        let dir = tempdir().expect("tempdir");
        write_csv(dir.path(), 2);

        let resp = test_app(Arc::new(InMemoryRemote::new()), 100, dir.path())
            .oneshot(post_json("/jobs/stream", import_body()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let text = body_text(resp).await;
        assert!(text.contains("event: log"));
        assert_eq!(text.matches("event: complete").count(), 1);
        assert!(!text.contains("event: error"));
        assert!(text.contains("\"created\":2"));
    }

    #[tokio::test]
    async fn streamed_chunk_without_job_reports_error_frame() {
        let dir = tempdir().expect("tempdir");
        let request = Request::builder()
            .method("POST")
            .uri("/jobs/next/stream")
            .body(Body::empty())
            .unwrap();
        let resp = test_app(Arc::new(InMemoryRemote::new()), 100, dir.path())
            .oneshot(request)
            .await
            .unwrap();
        let text = body_text(resp).await;
        assert_eq!(text.matches("event: error").count(), 1);
        assert!(text.contains("no job is active"));
        assert!(!text.contains("event: complete"));
    }

    #[tokio::test]
    async fn paths_outside_the_data_directory_are_refused() {
        let dir = tempdir().expect("tempdir");
        let data = dir.path().join("data");
        std::fs::create_dir(&data).unwrap();
        write_csv(dir.path(), 2);
        let remote = Arc::new(InMemoryRemote::new());
        let app = test_app(remote.clone(), 100, &data);

        let outside = dir.path().join("companies.csv");
        for body in [
            json!({ "jobType": "import", "resource": "company", "inputPath": "../companies.csv" }),
            json!({ "jobType": "import", "resource": "company", "inputPath": outside }),
            json!({
                "jobType": "export",
                "resource": "company",
                "outputPath": "reports/../../escape.csv"
            }),
        ] {
            for uri in ["/jobs", "/jobs/stream"] {
                let resp = app.clone().oneshot(post_json(uri, body.clone())).await.unwrap();
                assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri} {body}");
                let error = body_json(resp).await["error"].as_str().unwrap().to_string();
                assert!(error.contains("inside the data directory"), "{error}");
            }
        }
        assert_eq!(remote.count(ResourceType::Company).await, 0);
        assert!(!dir.path().join("escape.csv").exists());
    }

    #[test]
    fn relative_paths_resolve_under_the_root() {
        let root = Path::new("/srv/rowsync");
        assert_eq!(
            resolve_data_path(root, Path::new("./in/companies.csv")).unwrap(),
            PathBuf::from("/srv/rowsync/in/companies.csv")
        );
        assert!(resolve_data_path(root, Path::new("")).is_err());
        assert!(resolve_data_path(root, Path::new("in/../../x.csv")).is_err());
    }
}
