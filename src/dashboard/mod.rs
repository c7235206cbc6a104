use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::controller::Launcher;
use crate::error::SchedError;
use crate::model::{Job, JobSpec, ObjectKey, TaskPhase, TaskTemplate};
use crate::scheduler::QueueRegistry;
use crate::store::ObjectStore;

#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<dyn ObjectStore>,
    pub registry: Arc<QueueRegistry>,
    pub launcher: Launcher,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueResponse {
    name: String,
    current: Option<String>,
    pending: Vec<String>,
    size: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    namespace: String,
    name: String,
    queue: Option<String>,
    level: i32,
    min_gang: u32,
    phase: String,
    pending: u32,
    running: u32,
    succeeded: u32,
    failed: u32,
    unknown: u32,
    deleting: bool,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            namespace: job.metadata.namespace.clone(),
            name: job.metadata.name.clone(),
            queue: job.spec.queue.clone(),
            level: job.spec.level,
            min_gang: job.spec.min_gang,
            phase: job.status.phase.to_string(),
            pending: job.status.pending,
            running: job.status.running,
            succeeded: job.status.succeeded,
            failed: job.status.failed,
            unknown: job.status.unknown,
            deleting: job.metadata.is_deleting(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobRequest {
    #[serde(default = "default_namespace")]
    namespace: String,
    name: String,
    #[serde(default)]
    min_gang: u32,
    #[serde(default)]
    level: i32,
    #[serde(default)]
    queue: Option<String>,
    #[serde(default)]
    selector: BTreeMap<String, String>,
    #[serde(default)]
    tasks: Vec<TaskTemplate>,
}

#[derive(Deserialize)]
struct TaskPhaseRequest {
    phase: Option<TaskPhase>,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    key: Option<String>,
    error: Option<String>,
}

impl ActionResponse {
    fn ok(key: &ObjectKey) -> Self {
        Self {
            success: true,
            key: Some(key.to_string()),
            error: None,
        }
    }

    fn failed(error: &SchedError) -> (StatusCode, Json<Self>) {
        (
            error_status(error),
            Json(Self {
                success: false,
                key: None,
                error: Some(error.to_string()),
            }),
        )
    }
}

fn error_status(error: &SchedError) -> StatusCode {
    match error {
        SchedError::NotFound(_) => StatusCode::NOT_FOUND,
        SchedError::AlreadyExists(_)
        | SchedError::DuplicateKey(_)
        | SchedError::Conflict { .. } => StatusCode::CONFLICT,
        SchedError::InvalidObject(_) => StatusCode::BAD_REQUEST,
        SchedError::StoreUnavailable(_) | SchedError::LaunchIncomplete { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SchedError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Build the dashboard routes over `state`.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/queues", get(list_queues_handler))
        .route("/api/unschedulable", get(list_unschedulable_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/:namespace/:name", delete(delete_job_handler))
        .route("/api/tasks/:namespace/:name/phase", post(task_phase_handler))
        .route("/api/launcher", get(launcher_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the dashboard on `addr` until `token` is cancelled.
pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, token: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_queues_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let mut queues = Vec::new();
    for name in state.registry.queue_names().await {
        let Some(queue) = state.registry.get(&name).await else {
            continue;
        };
        let queue = queue.read().await;
        queues.push(QueueResponse {
            name: queue.name().to_string(),
            current: queue.peek_current().map(|job| job.key.to_string()),
            pending: queue.pending_keys().iter().map(ToString::to_string).collect(),
            size: queue.size(),
        });
    }
    Json(queues)
}

async fn list_unschedulable_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let keys: Vec<String> = state
        .registry
        .unschedulable_keys()
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    Json(keys)
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.store.list_jobs(None).await {
        Ok(jobs) => {
            let jobs: Vec<JobResponse> = jobs.iter().map(JobResponse::from).collect();
            (StatusCode::OK, Json(jobs)).into_response()
        }
        Err(e) => ActionResponse::failed(&e).into_response(),
    }
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    let spec = JobSpec {
        min_gang: payload.min_gang,
        level: payload.level,
        queue: payload.queue,
        selector: payload.selector,
        tasks: payload.tasks,
    };
    let job = Job::new(payload.namespace, payload.name, spec);

    match state.store.create_job(job).await {
        Ok(created) => {
            tracing::info!(job = %created.key(), "Job submitted via dashboard");
            (StatusCode::OK, Json(ActionResponse::ok(&created.key())))
        }
        Err(e) => ActionResponse::failed(&e),
    }
}

async fn delete_job_handler(
    State(state): State<DashboardState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = ObjectKey::new(namespace, name);
    match state.store.delete_job(&key).await {
        Ok(()) => (StatusCode::OK, Json(ActionResponse::ok(&key))),
        Err(e) => ActionResponse::failed(&e),
    }
}

async fn task_phase_handler(
    State(state): State<DashboardState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(payload): Json<TaskPhaseRequest>,
) -> impl IntoResponse {
    let key = ObjectKey::new(namespace, name);
    let mut task = match state.store.get_task(&key).await {
        Ok(task) => task,
        Err(e) => return ActionResponse::failed(&e),
    };
    task.status.phase = payload.phase;

    match state.store.update_task(&task).await {
        Ok(_) => (StatusCode::OK, Json(ActionResponse::ok(&key))),
        Err(e) => ActionResponse::failed(&e),
    }
}

async fn launcher_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.launcher.stats())
}
