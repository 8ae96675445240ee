//! Run orchestrator
//!
//! Plays a completed build: the transmitter streams the IQ slice of the
//! requested segments while the motion controller is fed the speed and
//! bearing of the nearest trajectory sample every feed tick.
//!
//! ```text
//! idle -> building -> idle
//! idle | stopped -> [waiting] -> running -> idle      (played to the end)
//!                                        -> stopped   (stop or failure)
//! ```

use crate::jobs::{parse_timestamp, BuildOutput};
use crate::sessions::{Session, TaskControl};
use crate::state::AppState;
use crate::telemetry::{SimEvent, StatusEvent, StatusSource};
use chrono::{DateTime, Utc};
use gpsim_core::{
    AppSettings, DeviceError, MotionCommand, MotionController, SegmentRange, SimError, SimResult,
    TelemetryFrame, Trajectory, Transmission,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    #[default]
    Idle,
    Building,
    Waiting,
    Running,
    Stopped,
}

impl RunPhase {
    /// A run task exists in these phases
    pub fn is_active(self) -> bool {
        matches!(self, RunPhase::Waiting | RunPhase::Running)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunState {
    pub state: RunPhase,
    pub active_range: Option<SegmentRange>,
    /// Trajectory time of the last fed sample
    pub playback_t: f64,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(rename = "startSegmentIdx", alias = "start_segment")]
    pub start_segment: i64,
    /// Defaults to the last segment
    #[serde(default, rename = "endSegmentIdx", alias = "end_segment")]
    pub end_segment: Option<i64>,
    /// Start transmitting at this wall-clock time instead of now
    #[serde(default)]
    pub start_time: Option<String>,
    /// Transmit only; leave the motion controller alone
    #[serde(default, rename = "gpsOnly", alias = "gps_only")]
    pub gps_only: bool,
}

struct RunPlan {
    session_id: String,
    build: Arc<BuildOutput>,
    range: SegmentRange,
    t_start: f64,
    t_end: f64,
    start_at: Option<DateTime<Utc>>,
    settings: AppSettings,
    gps_only: bool,
    grace: Duration,
}

enum Ended {
    Completed,
    Stopped,
}

/// Check `[start, end]` against the trajectory's segments
pub fn resolve_range(
    trajectory: &Trajectory,
    start: i64,
    end: Option<i64>,
) -> SimResult<SegmentRange> {
    let last = trajectory
        .last_segment()
        .ok_or_else(|| SimError::InvalidRoute("trajectory has no segments".to_string()))?;
    let end = end.unwrap_or(last as i64);
    if start < 0 || end < start || end > last as i64 {
        return Err(SimError::InvalidRoute(format!(
            "segment range {}..={} is outside 0..={}",
            start, end, last
        )));
    }
    Ok(SegmentRange::new(start as usize, end as usize))
}

fn run_status(session_id: &str, status: &str, error: Option<&SimError>) -> SimEvent {
    SimEvent::Status(StatusEvent {
        session_id: session_id.to_string(),
        source: StatusSource::Run,
        status: status.to_string(),
        job_id: None,
        progress: None,
        error: error.map(|e| e.to_string()),
    })
}

/// Start playing the session's latest build
pub async fn start(
    state: &AppState,
    session: &Arc<Session>,
    request: RunRequest,
) -> SimResult<RunState> {
    let start_at = match request.start_time.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(parse_timestamp(raw).ok_or_else(|| {
            SimError::InvalidRequest(format!("invalid start_time format: {}", raw))
        })?),
        _ => None,
    };
    let settings = state.settings.get().await;

    let mut inner = session.lock().await;
    if !matches!(inner.run.state, RunPhase::Idle | RunPhase::Stopped) {
        return Err(SimError::RunInProgress);
    }
    let entry = inner
        .latest_build
        .as_ref()
        .and_then(|id| inner.jobs.get(id))
        .ok_or(SimError::BuildNotReady)?;
    let build = entry.output.clone().ok_or(SimError::BuildNotReady)?;
    let current_hash = inner.scenario.as_ref().map(|s| s.content_hash());
    if current_hash.as_deref() != Some(entry.job.scenario_hash.as_str()) {
        return Err(SimError::BuildOutdated);
    }

    let range = resolve_range(&build.trajectory, request.start_segment, request.end_segment)?;
    let (t_start, t_end) = build
        .trajectory
        .segment_window(range.start_segment, range.end_segment)
        .ok_or_else(|| {
            SimError::InvalidRoute(format!(
                "segments {}..={} have zero length",
                range.start_segment, range.end_segment
            ))
        })?;

    let permit = state.device_lock.clone().try_acquire_owned().map_err(|_| {
        SimError::DeviceBusy("radio and motion controller are held by another run".to_string())
    })?;

    let waiting = start_at.is_some_and(|at| at > Utc::now());
    inner.run = RunState {
        state: if waiting {
            RunPhase::Waiting
        } else {
            RunPhase::Running
        },
        active_range: (!waiting).then_some(range),
        playback_t: t_start,
        error: None,
        error_code: None,
    };
    let (control, done) = TaskControl::new();
    let cancel = control.token();
    inner.active_run = Some(control);
    let snapshot = inner.run.clone();
    drop(inner);

    state.telemetry.publish(SimEvent::state(session.id(), &snapshot));
    state.telemetry.publish(run_status(
        session.id(),
        if waiting { "waiting" } else { "running" },
        None,
    ));
    info!(
        session_id = %session.id(),
        start_segment = range.start_segment,
        end_segment = range.end_segment,
        t_start,
        t_end,
        waiting,
        gps_only = request.gps_only,
        "Run started"
    );

    let plan = RunPlan {
        session_id: session.id().to_string(),
        build,
        range,
        t_start,
        t_end,
        start_at: start_at.filter(|_| waiting),
        settings,
        gps_only: request.gps_only,
        grace: state.config.stop_grace,
    };
    tokio::spawn(playback(
        state.clone(),
        session.clone(),
        plan,
        permit,
        cancel,
        done,
    ));
    Ok(snapshot)
}

/// Stop the run and wait for teardown
///
/// Returns the state as left by the run task; a session with no active run
/// is returned unchanged.
pub async fn stop(session: &Session) -> RunState {
    let control = session.lock().await.active_run.clone();
    if let Some(control) = control {
        info!(session_id = %session.id(), "Stopping run");
        control.cancel_and_wait().await;
    }
    session.run_state().await
}

async fn playback(
    state: AppState,
    session: Arc<Session>,
    plan: RunPlan,
    permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
) {
    let ended = if wait_for_start(&state, &session, &plan, &cancel).await {
        drive(&state, &session, &plan, &cancel).await
    } else {
        Ok(Ended::Stopped)
    };
    drop(permit);
    finish(&state, &session, ended).await;
    let _ = done.send(true);
}

/// Sleep through the waiting phase; false when stopped before the start time
async fn wait_for_start(
    state: &AppState,
    session: &Session,
    plan: &RunPlan,
    cancel: &CancellationToken,
) -> bool {
    let Some(start_at) = plan.start_at else {
        return true;
    };
    let delay = (start_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    debug!(session_id = %plan.session_id, ?delay, "Waiting for start time");
    tokio::select! {
        _ = cancel.cancelled() => return false,
        _ = tokio::time::sleep(delay) => {}
    }

    let mut inner = session.lock().await;
    inner.run.state = RunPhase::Running;
    inner.run.active_range = Some(plan.range);
    state.telemetry.publish(SimEvent::state(session.id(), &inner.run));
    state
        .telemetry
        .publish(run_status(session.id(), "running", None));
    true
}

/// Devices held by a run, released by [`Rig::teardown`]
#[derive(Default)]
struct Rig {
    controller: Option<Box<dyn MotionController>>,
    transmission: Option<Box<dyn Transmission>>,
}

impl Rig {
    async fn teardown(&mut self, grace: Duration) {
        if let Some(mut transmission) = self.transmission.take() {
            if let Err(e) = transmission.shutdown(grace).await {
                warn!("Transmitter shutdown failed: {}", e);
            }
        }
        if let Some(mut controller) = self.controller.take() {
            if let Err(e) = controller.close().await {
                warn!(controller = controller.name(), "Controller close failed: {}", e);
            }
        }
    }
}

async fn drive(
    state: &AppState,
    session: &Session,
    plan: &RunPlan,
    cancel: &CancellationToken,
) -> SimResult<Ended> {
    let mut rig = Rig::default();
    let result = feed(state, session, plan, cancel, &mut rig).await;
    rig.teardown(plan.grace).await;
    result
}

async fn wait_transmission(
    transmission: &mut Option<Box<dyn Transmission>>,
) -> Result<(), DeviceError> {
    match transmission {
        Some(transmission) => transmission.wait().await,
        None => std::future::pending().await,
    }
}

async fn feed(
    state: &AppState,
    session: &Session,
    plan: &RunPlan,
    cancel: &CancellationToken,
    rig: &mut Rig,
) -> SimResult<Ended> {
    let trajectory = &plan.build.trajectory;
    // the radio can only start on a whole byte of samples
    let t_start = plan.build.layout.aligned_start(plan.t_start);
    let first = trajectory
        .sample_at(t_start)
        .copied()
        .ok_or_else(|| SimError::InvalidRoute("trajectory is empty".to_string()))?;

    if !plan.gps_only {
        let controller = rig
            .controller
            .insert(state.devices.open_controller(&plan.settings.controller).await?);
        controller.halt().await?;
        controller.calibrate_heading(first.bearing_deg).await?;
    }

    let transmitter = state.devices.transmitter(&plan.settings);
    let source = plan
        .build
        .layout
        .slice(plan.build.iq_path.clone(), plan.t_start, plan.t_end);
    let transmission = rig.transmission.insert(transmitter.start(source).await?);
    info!(
        session_id = %plan.session_id,
        transmitter = transmitter.name(),
        pid = ?transmission.id(),
        "Playback clock started"
    );

    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(
        plan.settings.controller.feed_interval_ms,
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut radio_done = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Ended::Stopped),
            exit = wait_transmission(&mut rig.transmission), if !radio_done => {
                exit?;
                debug!(session_id = %plan.session_id, "Transmitter reached the end of its range");
                radio_done = true;
            }
            _ = ticker.tick() => {
                let playback_t = (t_start + started.elapsed().as_secs_f64()).min(plan.t_end);
                let Some(sample) = trajectory.sample_at(playback_t).copied() else {
                    continue;
                };
                if let Some(controller) = rig.controller.as_mut() {
                    controller
                        .send(MotionCommand {
                            speed_kmh: sample.speed().to_kmh().0,
                            bearing_deg: sample.bearing_deg,
                        })
                        .await?;
                }
                session.lock().await.run.playback_t = playback_t;
                state.telemetry.publish(SimEvent::data(
                    &plan.session_id,
                    TelemetryFrame::from_sample(&sample, playback_t),
                ));
                if playback_t >= plan.t_end {
                    return Ok(Ended::Completed);
                }
            }
        }
    }
}

async fn finish(state: &AppState, session: &Session, ended: SimResult<Ended>) {
    let mut inner = session.lock().await;
    inner.active_run = None;
    let (phase, status, error) = match ended {
        Ok(Ended::Completed) => (RunPhase::Idle, "completed", None),
        Ok(Ended::Stopped) => (RunPhase::Stopped, "stopped", None),
        Err(e) => {
            warn!(session_id = %session.id(), "Run failed: {}", e);
            (RunPhase::Stopped, "failed", Some(e))
        }
    };
    inner.run = RunState {
        state: phase,
        active_range: None,
        playback_t: inner.run.playback_t,
        error: error.as_ref().map(|e| e.to_string()),
        error_code: error.as_ref().map(|e| e.code().to_string()),
    };
    state.telemetry.publish(SimEvent::state(session.id(), &inner.run));
    state
        .telemetry
        .publish(run_status(session.id(), status, error.as_ref()));
    info!(session_id = %session.id(), state = ?phase, "Run ended");
}
