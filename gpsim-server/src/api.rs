//! REST API and SSE routes

use crate::jobs::{self, BuildJob, GenRequest};
use crate::run::{self, RunRequest, RunState};
use crate::sessions::{self, SessionInfo};
use crate::state::AppState;
use crate::telemetry::SimEvent;
use crate::ws;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt as FuturesStreamExt};
use gpsim_core::{AppSettings, ScenarioFile, SimError, Waypoint};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/scenario", get(get_scenario).put(put_scenario))
        .route("/sessions/:id/route/points", post(insert_point))
        .route(
            "/sessions/:id/route/points/:index",
            put(move_point).delete(delete_point),
        )
        // Build jobs
        .route("/sessions/:id/gen", post(submit_gen))
        .route("/sessions/:id/gen/:job_id", get(get_gen))
        .route("/sessions/:id/gen/:job_id/cancel", post(cancel_gen))
        .route("/sessions/:id/gen/:job_id/events", get(gen_events))
        // Playback
        .route("/sim/run", post(sim_run))
        .route("/sim/stop", post(sim_stop))
        .route("/sim/status", get(sim_status))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/ws/sim", get(ws::sim_socket))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// === Errors ===

/// `SimError` as an HTTP response: `{"error": code, "detail": message}`
pub struct ApiError(pub SimError);

impl From<SimError> for ApiError {
    fn from(err: SimError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            e if e.is_conflict() => StatusCode::CONFLICT,
            SimError::NotFound(_) => StatusCode::NOT_FOUND,
            SimError::DeviceBusy(_) => StatusCode::LOCKED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self.0);
        }
        let body = serde_json::json!({
            "error": self.0.code(),
            "detail": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// === Session Endpoints ===

#[derive(Deserialize, Default)]
struct CreateSessionRequest {
    name: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let info = state.sessions.create(request.name).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionInfo> {
    let session = state.sessions.get(&id).await?;
    Ok(Json(session.info().clone()))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    sessions::delete(&state, &id).await?;
    Ok(Json(serde_json::json!({
        "status": "deleted",
        "session_id": id,
    })))
}

// === Scenario Endpoints ===

async fn get_scenario(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ScenarioFile> {
    let session = state.sessions.get(&id).await?;
    let file = session.lock().await.scenario_file()?;
    Ok(Json(file))
}

async fn put_scenario(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(file): Json<ScenarioFile>,
) -> ApiResult<ScenarioFile> {
    let session = state.sessions.get(&id).await?;
    let file = session.lock().await.replace_scenario(file)?;
    state.sessions.touch(&id).await;
    Ok(Json(file))
}

#[derive(Deserialize)]
struct InsertPointRequest {
    index: usize,
    point: Waypoint,
}

async fn insert_point(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<InsertPointRequest>,
) -> ApiResult<ScenarioFile> {
    let session = state.sessions.get(&id).await?;
    let file = session
        .lock()
        .await
        .insert_point(request.index, request.point)?;
    state.sessions.touch(&id).await;
    Ok(Json(file))
}

async fn move_point(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, usize)>,
    Json(point): Json<Waypoint>,
) -> ApiResult<ScenarioFile> {
    let session = state.sessions.get(&id).await?;
    let file = session.lock().await.move_point(index, point)?;
    state.sessions.touch(&id).await;
    Ok(Json(file))
}

async fn delete_point(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, usize)>,
) -> ApiResult<ScenarioFile> {
    let session = state.sessions.get(&id).await?;
    let file = session.lock().await.delete_point(index)?;
    state.sessions.touch(&id).await;
    Ok(Json(file))
}

// === Build Endpoints ===

async fn submit_gen(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<GenRequest>,
) -> ApiResult<BuildJob> {
    let session = state.sessions.get(&id).await?;
    let job = jobs::submit(&state, &session, request).await?;
    state.sessions.touch(&id).await;
    Ok(Json(job))
}

async fn get_gen(
    State(state): State<AppState>,
    Path((id, job_id)): Path<(String, String)>,
) -> ApiResult<BuildJob> {
    let session = state.sessions.get(&id).await?;
    Ok(Json(jobs::poll(&session, &job_id).await?))
}

async fn cancel_gen(
    State(state): State<AppState>,
    Path((id, job_id)): Path<(String, String)>,
) -> ApiResult<BuildJob> {
    let session = state.sessions.get(&id).await?;
    Ok(Json(jobs::cancel(&session, &job_id).await?))
}

fn job_event(job: &BuildJob) -> Event {
    match serde_json::to_string(job) {
        Ok(json) => Event::default().event("status").data(json),
        Err(e) => {
            tracing::error!("Failed to serialize job: {}", e);
            Event::default().event("error").data(e.to_string())
        }
    }
}

/// SSE stream of one job's status, ending after its terminal state
async fn gen_events(
    State(state): State<AppState>,
    Path((id, job_id)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state.sessions.get(&id).await?;
    // Subscribe before the snapshot so no transition falls in between
    let rx = state.telemetry.receiver();
    let current = jobs::poll(&session, &job_id).await?;

    let updates = BroadcastStream::new(rx).filter_map(move |result| {
        let session = session.clone();
        let job_id = job_id.clone();
        async move {
            let relevant = match &result {
                Ok(SimEvent::Status(status)) => status.job_id.as_deref() == Some(job_id.as_str()),
                Ok(_) => false,
                // lagged: re-read the job rather than miss its end
                Err(_) => true,
            };
            if !relevant {
                return None;
            }
            jobs::poll(&session, &job_id).await.ok()
        }
    });

    // Ends right after the terminal state, without waiting for another event
    let stream = stream::unfold(
        (Some(current), Box::pin(updates), false),
        |(first, mut updates, finished)| async move {
            if finished {
                return None;
            }
            let job = match first {
                Some(job) => job,
                None => updates.next().await?,
            };
            let finished = job.status.is_terminal();
            Some((Ok::<_, Infallible>(job_event(&job)), (None, updates, finished)))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// === Playback Endpoints ===

#[derive(Serialize)]
struct SimStatus {
    session_id: Option<String>,
    #[serde(flatten)]
    run: RunState,
    is_running: bool,
    client_count: usize,
}

impl SimStatus {
    fn new(state: &AppState, session_id: Option<String>, run: RunState) -> Self {
        Self {
            session_id,
            is_running: run.state == run::RunPhase::Running,
            run,
            client_count: state.telemetry.client_count(),
        }
    }
}

async fn sim_run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> ApiResult<SimStatus> {
    let session = state.sessions.resolve(request.session_id.as_deref()).await?;
    let run = run::start(&state, &session, request).await?;
    Ok(Json(SimStatus::new(&state, Some(session.id().to_string()), run)))
}

#[derive(Deserialize, Default)]
struct SessionSelector {
    session_id: Option<String>,
}

async fn sim_stop(
    State(state): State<AppState>,
    body: Option<Json<SessionSelector>>,
) -> ApiResult<SimStatus> {
    let selector = body.map(|Json(s)| s).unwrap_or_default();
    let session = state.sessions.resolve(selector.session_id.as_deref()).await?;
    let run = run::stop(&session).await;
    Ok(Json(SimStatus::new(&state, Some(session.id().to_string()), run)))
}

async fn sim_status(
    State(state): State<AppState>,
    Query(selector): Query<SessionSelector>,
) -> ApiResult<SimStatus> {
    let session = match selector.session_id.as_deref() {
        Some(id) => Some(state.sessions.get(id).await?),
        None => state.sessions.recent().await,
    };
    let status = match session {
        Some(session) => SimStatus::new(
            &state,
            Some(session.id().to_string()),
            session.run_state().await,
        ),
        None => SimStatus::new(&state, None, RunState::default()),
    };
    Ok(Json(status))
}

// === Settings Endpoints ===

async fn get_settings(State(state): State<AppState>) -> Json<AppSettings> {
    Json(state.settings.get().await)
}

async fn put_settings(
    State(state): State<AppState>,
    Json(settings): Json<AppSettings>,
) -> ApiResult<AppSettings> {
    Ok(Json(state.settings.update(settings).await?))
}
