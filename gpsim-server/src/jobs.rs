//! Signal build pipeline
//!
//! A build integrates the scenario into a trajectory, writes the motion
//! table, then renders the IQ file. It runs as a background task per session;
//! callers poll or cancel it by job id.

use crate::run::{RunPhase, RunState};
use crate::sessions::{short_id, Session, SessionInner, TaskControl};
use crate::state::AppState;
use crate::telemetry::{SimEvent, StatusEvent, StatusSource};
use chrono::{DateTime, NaiveDateTime, Utc};
use gpsim_core::motion_table::write_motion_csv;
use gpsim_core::{
    integrate, AppSettings, GenerateOutcome, IqLayout, IqRequest, Scenario, ScenarioFile,
    SimError, SimResult, Trajectory,
};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_DT_S: f64 = 0.1;
pub const DEFAULT_MOTION_OUTPUT: &str = "motion.csv";
pub const DEFAULT_IQ_OUTPUT: &str = "route.iq";

/// Integrate + write table, then IQ generation
const BUILD_STEPS: u32 = 2;

/// Finished jobs a session keeps for polling, besides its latest completed build
pub const RETAINED_JOBS: usize = 8;

/// Start time format understood by gps-sdr-sim
const TOOL_TIME_FORMAT: &str = "%Y/%m/%d,%H:%M:%S";

#[derive(Debug, Clone, Deserialize)]
pub struct GenRequest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub scenario: Scenario,
    #[serde(default = "default_dt")]
    pub dt_s: f64,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub outputs: GenOutputs,
}

fn default_schema_version() -> u32 {
    gpsim_core::model::SCENARIO_SCHEMA_VERSION
}

fn default_dt() -> f64 {
    DEFAULT_DT_S
}

/// Artifact names, relative to `<work_dir>/out/`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenOutputs {
    pub motion_csv: String,
    pub iq: String,
}

impl Default for GenOutputs {
    fn default() -> Self {
        Self {
            motion_csv: DEFAULT_MOTION_OUTPUT.to_string(),
            iq: DEFAULT_IQ_OUTPUT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Artifacts {
    pub motion_path: Option<PathBuf>,
    pub iq_path: Option<PathBuf>,
}

/// Client-visible job record
#[derive(Debug, Clone, Serialize)]
pub struct BuildJob {
    pub job_id: String,
    pub session_id: String,
    pub status: JobStatus,
    pub progress: Progress,
    pub artifacts: Artifacts,
    pub error: Option<String>,
    pub scenario_hash: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What a completed build leaves behind for playback
#[derive(Debug)]
pub struct BuildOutput {
    pub trajectory: Arc<Trajectory>,
    pub motion_path: PathBuf,
    pub iq_path: PathBuf,
    /// IQ settings in force when the file was rendered
    pub layout: IqLayout,
}

pub struct JobEntry {
    pub job: BuildJob,
    pub output: Option<Arc<BuildOutput>>,
    control: Option<TaskControl>,
}

/// A validated request, ready to execute
#[derive(Debug, Clone)]
struct BuildPlan {
    scenario: Scenario,
    dt_s: f64,
    motion_path: PathBuf,
    iq_path: PathBuf,
    start_time: Option<String>,
    settings: AppSettings,
}

impl BuildPlan {
    fn prepare(work_dir: &Path, request: GenRequest, settings: AppSettings) -> SimResult<Self> {
        let file = ScenarioFile {
            schema_version: request.schema_version,
            scenario: request.scenario,
        };
        file.validate_version()?;
        file.scenario.validate()?;
        file.scenario.route.validate_drivable()?;
        if !request.dt_s.is_finite() || request.dt_s <= 0.0 {
            return Err(SimError::InvalidProfile(format!(
                "dt_s must be > 0, got {}",
                request.dt_s
            )));
        }
        let motion_path =
            resolve_output(work_dir, &request.outputs.motion_csv, DEFAULT_MOTION_OUTPUT)?;
        let iq_path = resolve_output(work_dir, &request.outputs.iq, DEFAULT_IQ_OUTPUT)?;
        if motion_path == iq_path {
            return Err(SimError::InvalidRequest(
                "motion_csv and iq outputs must differ".to_string(),
            ));
        }
        Ok(Self {
            scenario: file.scenario,
            dt_s: request.dt_s,
            motion_path,
            iq_path,
            start_time: tool_start_time(request.start_time.as_deref())?,
            settings,
        })
    }
}

/// Resolve an artifact name under `<work_dir>/out/`
pub fn resolve_output(work_dir: &Path, value: &str, fallback: &str) -> SimResult<PathBuf> {
    let raw = value.trim();
    let name = Path::new(if raw.is_empty() { fallback } else { raw });
    if name.is_absolute() || name.has_root() {
        return Err(SimError::InvalidRequest(format!(
            "output path must be relative: {}",
            name.display()
        )));
    }
    if name.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(SimError::InvalidRequest(format!(
            "output path must not contain '..': {}",
            name.display()
        )));
    }
    Ok(work_dir.join("out").join(name))
}

/// Parse an RFC 3339 timestamp, or a naive `YYYY-MM-DDThh:mm:ss` taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Convert a requested start time to gps-sdr-sim's `YYYY/MM/DD,hh:mm:ss`
pub fn tool_start_time(value: Option<&str>) -> SimResult<Option<String>> {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if raw.contains('/') && raw.contains(',') {
        return NaiveDateTime::parse_from_str(raw, TOOL_TIME_FORMAT)
            .map(|_| Some(raw.to_string()))
            .map_err(|_| invalid_start_time(raw));
    }
    parse_timestamp(raw)
        .map(|t| Some(t.format(TOOL_TIME_FORMAT).to_string()))
        .ok_or_else(|| invalid_start_time(raw))
}

fn invalid_start_time(raw: &str) -> SimError {
    SimError::InvalidRequest(format!("invalid start_time format: {}", raw))
}

fn join_error(e: tokio::task::JoinError) -> SimError {
    SimError::Io(io::Error::other(e))
}

fn status_event(job: &BuildJob) -> SimEvent {
    SimEvent::Status(StatusEvent {
        session_id: job.session_id.clone(),
        source: StatusSource::Build,
        status: job.status.as_str().to_string(),
        job_id: Some(job.job_id.clone()),
        progress: Some(job.progress),
        error: job.error.clone(),
    })
}

/// Validate `request` and start a build job for `session`
pub async fn submit(
    state: &AppState,
    session: &Arc<Session>,
    request: GenRequest,
) -> SimResult<BuildJob> {
    let settings = state.settings.get().await;
    let plan = BuildPlan::prepare(session.work_dir(), request, settings)?;

    let mut inner = session.lock().await;
    if inner.active_job.is_some() {
        return Err(SimError::BuildInProgress);
    }
    if inner.run.state.is_active() {
        return Err(SimError::RunActive);
    }

    let job_id = loop {
        let candidate = short_id();
        if !inner.jobs.contains_key(&candidate) {
            break candidate;
        }
    };
    let job = BuildJob {
        job_id: job_id.clone(),
        session_id: session.id().to_string(),
        status: JobStatus::Pending,
        progress: Progress {
            current: 0,
            total: BUILD_STEPS,
        },
        artifacts: Artifacts::default(),
        error: None,
        scenario_hash: plan.scenario.content_hash(),
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
    };

    let (control, done) = TaskControl::new();
    let cancel = control.token();
    inner.jobs.insert(
        job_id.clone(),
        JobEntry {
            job: job.clone(),
            output: None,
            control: Some(control),
        },
    );
    inner.active_job = Some(job_id.clone());
    inner.scenario = Some(plan.scenario.clone());
    if matches!(inner.run.state, RunPhase::Idle | RunPhase::Stopped) {
        inner.run = RunState {
            state: RunPhase::Building,
            ..RunState::default()
        };
        state.telemetry.publish(SimEvent::state(session.id(), &inner.run));
    }
    state.telemetry.publish(status_event(&job));
    drop(inner);

    info!(
        session_id = %session.id(),
        job_id = %job_id,
        points = plan.scenario.route.points.len(),
        dt_s = plan.dt_s,
        "Build submitted"
    );
    tokio::spawn(run_job(
        state.clone(),
        session.clone(),
        job_id,
        plan,
        cancel,
        done,
    ));
    Ok(job)
}

pub async fn poll(session: &Session, job_id: &str) -> SimResult<BuildJob> {
    session
        .lock()
        .await
        .jobs
        .get(job_id)
        .map(|entry| entry.job.clone())
        .ok_or_else(|| job_not_found(job_id))
}

/// Cancel a job and wait until its tool has exited
///
/// A job that already ended is returned unchanged.
pub async fn cancel(session: &Session, job_id: &str) -> SimResult<BuildJob> {
    let control = {
        let inner = session.lock().await;
        let entry = inner.jobs.get(job_id).ok_or_else(|| job_not_found(job_id))?;
        if entry.job.status.is_terminal() {
            return Ok(entry.job.clone());
        }
        entry.control.clone()
    };
    if let Some(control) = control {
        info!(session_id = %session.id(), job_id, "Canceling build");
        control.cancel_and_wait().await;
    }
    poll(session, job_id).await
}

fn job_not_found(job_id: &str) -> SimError {
    SimError::NotFound(format!("job {}", job_id))
}

async fn run_job(
    state: AppState,
    session: Arc<Session>,
    job_id: String,
    plan: BuildPlan,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
) {
    update(&state, &session, &job_id, |job| {
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
    })
    .await;

    let result = execute(&state, &session, &job_id, plan, &cancel).await;
    finish(&state, &session, &job_id, result, &cancel).await;
    let _ = done.send(true);
}

async fn execute(
    state: &AppState,
    session: &Session,
    job_id: &str,
    plan: BuildPlan,
    cancel: &CancellationToken,
) -> SimResult<Option<BuildOutput>> {
    let BuildPlan {
        scenario,
        dt_s,
        motion_path,
        iq_path,
        start_time,
        settings,
    } = plan;

    let route = scenario.route.clone();
    let profile = *scenario.profile();
    let integration = tokio::task::spawn_blocking(move || integrate(&route, &profile, dt_s));
    let trajectory = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        joined = integration => Arc::new(joined.map_err(join_error)??),
    };
    info!(
        session_id = %session.id(),
        job_id,
        samples = trajectory.len(),
        duration_s = trajectory.duration(),
        "Trajectory integrated"
    );

    let table = trajectory.clone();
    let table_path = motion_path.clone();
    tokio::task::spawn_blocking(move || write_motion_csv(&table_path, table.samples()))
        .await
        .map_err(join_error)?
        .map_err(|e| SimError::Io(io::Error::other(format!("{:#}", e))))?;
    update(state, session, job_id, |job| {
        job.progress.current = 1;
        job.artifacts.motion_path = Some(motion_path.clone());
    })
    .await;

    if cancel.is_cancelled() {
        return Ok(None);
    }
    if let Some(parent) = iq_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let generator = state.devices.iq_generator(&settings);
    info!(job_id, generator = generator.name(), iq = %iq_path.display(), "Generating IQ");
    let request = IqRequest {
        trajectory: trajectory.clone(),
        output_path: iq_path,
        settings: settings.iq_generator.clone(),
        start_time,
    };
    match generator.generate(request, cancel.clone()).await? {
        GenerateOutcome::Completed(iq_path) => Ok(Some(BuildOutput {
            trajectory,
            motion_path,
            iq_path,
            layout: IqLayout::from_settings(&settings.iq_generator),
        })),
        GenerateOutcome::Canceled => Ok(None),
    }
}

/// Mutate the job record and announce it
async fn update(
    state: &AppState,
    session: &Session,
    job_id: &str,
    change: impl FnOnce(&mut BuildJob),
) {
    let mut inner = session.lock().await;
    if let Some(entry) = inner.jobs.get_mut(job_id) {
        change(&mut entry.job);
        state.telemetry.publish(status_event(&entry.job));
    }
}

async fn finish(
    state: &AppState,
    session: &Session,
    job_id: &str,
    result: SimResult<Option<BuildOutput>>,
    cancel: &CancellationToken,
) {
    let mut inner = session.lock().await;
    let Some(entry) = inner.jobs.get_mut(job_id) else {
        return;
    };
    entry.control = None;
    entry.job.finished_at = Some(Utc::now());

    let mut completed = false;
    match result {
        Ok(Some(output)) if !cancel.is_cancelled() => {
            entry.job.status = JobStatus::Completed;
            entry.job.progress.current = BUILD_STEPS;
            entry.job.artifacts = Artifacts {
                motion_path: Some(output.motion_path.clone()),
                iq_path: Some(output.iq_path.clone()),
            };
            entry.output = Some(Arc::new(output));
            completed = true;
            info!(session_id = %session.id(), job_id, "Build completed");
        }
        Ok(_) => {
            entry.job.status = JobStatus::Canceled;
            info!(session_id = %session.id(), job_id, "Build canceled");
        }
        Err(e) => {
            warn!(session_id = %session.id(), job_id, "Build failed: {}", e);
            entry.job.status = JobStatus::Failed;
            entry.job.error = Some(e.to_string());
        }
    }
    let event = status_event(&entry.job);

    if completed {
        inner.latest_build = Some(job_id.to_string());
    }
    if inner.active_job.as_deref() == Some(job_id) {
        inner.active_job = None;
    }
    prune_jobs(&mut inner);
    if inner.run.state == RunPhase::Building {
        inner.run = RunState::default();
        state.telemetry.publish(SimEvent::state(session.id(), &inner.run));
    }
    state.telemetry.publish(event);
}

/// Drop the oldest finished jobs beyond [`RETAINED_JOBS`]
fn prune_jobs(inner: &mut SessionInner) {
    let latest = inner.latest_build.as_deref();
    let mut finished: Vec<(DateTime<Utc>, String)> = inner
        .jobs
        .iter()
        .filter(|(id, entry)| entry.job.status.is_terminal() && latest != Some(id.as_str()))
        .map(|(id, entry)| (entry.job.created_at, id.clone()))
        .collect();
    if finished.len() <= RETAINED_JOBS {
        return;
    }
    finished.sort();
    let excess = finished.len() - RETAINED_JOBS;
    for (_, job_id) in finished.into_iter().take(excess) {
        inner.jobs.remove(&job_id);
    }
}
