//! Session manager
//!
//! A session owns a work directory, the working scenario, its build jobs and
//! at most one run. All transitions go through the session's async mutex.

use crate::jobs::{self, JobEntry};
use crate::run::{self, RunPhase, RunState};
use crate::state::AppState;
use chrono::{DateTime, Utc};
use gpsim_core::{Route, Scenario, ScenarioFile, SegmentRange, SimError, SimResult, Waypoint};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub work_dir: PathBuf,
}

/// Cancel handle for a background build or run
///
/// `done` flips to `true` once the task has released everything it started.
#[derive(Clone)]
pub struct TaskControl {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl TaskControl {
    pub fn new() -> (Self, watch::Sender<bool>) {
        let (tx, done) = watch::channel(false);
        (
            Self {
                cancel: CancellationToken::new(),
                done,
            },
            tx,
        )
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal the task and wait until it has torn down
    pub async fn cancel_and_wait(mut self) {
        self.cancel.cancel();
        // Err: the task exited without signalling
        let _ = self.done.wait_for(|done| *done).await;
    }
}

#[derive(Default)]
pub struct SessionInner {
    /// Latest scenario set by a build submit or an edit
    pub scenario: Option<Scenario>,
    pub jobs: HashMap<String, JobEntry>,
    /// Non-terminal job, if any
    pub active_job: Option<String>,
    /// Most recent completed job
    pub latest_build: Option<String>,
    pub run: RunState,
    pub(crate) active_run: Option<TaskControl>,
}

impl SessionInner {
    fn locked_range(&self) -> Option<SegmentRange> {
        match self.run.state {
            RunPhase::Running => self.run.active_range,
            _ => None,
        }
    }

    fn check_waypoint(&self, index: usize) -> SimResult<()> {
        match self.locked_range() {
            Some(range) if range.locks_waypoint(index) => Err(SimError::SegmentLocked {
                waypoint: index,
                start: range.start_segment,
                end: range.end_segment,
            }),
            _ => Ok(()),
        }
    }

    /// Inserting or removing at `index` renumbers every waypoint after it,
    /// so nothing at or before the end of the live range may shift
    fn check_shift(&self, index: usize) -> SimResult<()> {
        match self.locked_range() {
            Some(range) if index <= range.end_segment + 1 => Err(SimError::SegmentLocked {
                waypoint: index,
                start: range.start_segment,
                end: range.end_segment,
            }),
            _ => Ok(()),
        }
    }

    fn scenario(&self) -> SimResult<&Scenario> {
        self.scenario
            .as_ref()
            .ok_or_else(|| SimError::NotFound("scenario".to_string()))
    }

    pub fn scenario_file(&self) -> SimResult<ScenarioFile> {
        Ok(ScenarioFile::new(self.scenario()?.clone()))
    }

    /// Apply `edit` to a copy of the route and keep it only if it validates
    fn edit_route(
        &mut self,
        edit: impl FnOnce(&mut Route) -> SimResult<()>,
    ) -> SimResult<ScenarioFile> {
        let mut scenario = self.scenario()?.clone();
        edit(&mut scenario.route)?;
        scenario.validate()?;
        self.scenario = Some(scenario);
        self.scenario_file()
    }

    pub fn replace_scenario(&mut self, file: ScenarioFile) -> SimResult<ScenarioFile> {
        file.validate_version()?;
        file.scenario.validate()?;
        if let (Some(range), Some(current)) = (self.locked_range(), self.scenario.as_ref()) {
            let old = &current.route.points;
            let new = &file.scenario.route.points;
            for index in range.start_segment..=range.end_segment + 1 {
                if old.get(index) != new.get(index) {
                    self.check_waypoint(index)?;
                }
            }
        }
        self.scenario = Some(file.scenario);
        self.scenario_file()
    }

    pub fn move_point(&mut self, index: usize, point: Waypoint) -> SimResult<ScenarioFile> {
        let len = self.scenario()?.route.points.len();
        if index >= len {
            return Err(out_of_range(index, len));
        }
        self.check_waypoint(index)?;
        self.edit_route(|route| {
            route.points[index] = point;
            Ok(())
        })
    }

    pub fn insert_point(&mut self, index: usize, point: Waypoint) -> SimResult<ScenarioFile> {
        let len = self.scenario()?.route.points.len();
        if index > len {
            return Err(out_of_range(index, len));
        }
        self.check_shift(index)?;
        self.edit_route(|route| {
            route.points.insert(index, point);
            Ok(())
        })
    }

    pub fn delete_point(&mut self, index: usize) -> SimResult<ScenarioFile> {
        let len = self.scenario()?.route.points.len();
        if index >= len {
            return Err(out_of_range(index, len));
        }
        self.check_shift(index)?;
        self.edit_route(|route| {
            route.points.remove(index);
            Ok(())
        })
    }
}

fn out_of_range(index: usize, len: usize) -> SimError {
    SimError::InvalidRoute(format!(
        "waypoint index {} out of range for {} points",
        index, len
    ))
}

pub struct Session {
    info: SessionInfo,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(info: SessionInfo) -> Self {
        Self {
            info,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.session_id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn work_dir(&self) -> &Path {
        &self.info.work_dir
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().await
    }

    pub async fn run_state(&self) -> RunState {
        self.inner.lock().await.run.clone()
    }
}

/// In-memory registry of sessions under one root directory
pub struct SessionManager {
    root: PathBuf,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Target of `/sim/*` requests that name no session
    recent: RwLock<Option<String>>,
}

impl SessionManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: RwLock::new(HashMap::new()),
            recent: RwLock::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn create(&self, name: Option<String>) -> SimResult<SessionInfo> {
        let mut sessions = self.sessions.write().await;
        let session_id = loop {
            let candidate = short_id();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let work_dir = self.root.join(&session_id);
        tokio::fs::create_dir_all(&work_dir).await?;

        let info = SessionInfo {
            session_id: session_id.clone(),
            name: name.filter(|n| !n.trim().is_empty()),
            created_at: Utc::now(),
            work_dir,
        };
        sessions.insert(session_id.clone(), Arc::new(Session::new(info.clone())));
        *self.recent.write().await = Some(session_id.clone());
        info!(session_id = %session_id, name = ?info.name, "Session created");
        Ok(info)
    }

    pub async fn get(&self, session_id: &str) -> SimResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SimError::NotFound(format!("session {}", session_id)))
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info().clone())
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    /// Mark `session_id` as the most recently used session
    pub async fn touch(&self, session_id: &str) {
        *self.recent.write().await = Some(session_id.to_string());
    }

    /// The named session, or the most recently used one
    pub async fn resolve(&self, session_id: Option<&str>) -> SimResult<Arc<Session>> {
        match session_id {
            Some(id) => {
                let session = self.get(id).await?;
                self.touch(id).await;
                Ok(session)
            }
            None => {
                let recent = self.recent.read().await.clone();
                match recent {
                    Some(id) => self.get(&id).await,
                    None => Err(SimError::NotFound("session".to_string())),
                }
            }
        }
    }

    pub async fn recent(&self) -> Option<Arc<Session>> {
        let recent = self.recent.read().await.clone()?;
        self.get(&recent).await.ok()
    }

    async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(session_id);
        let mut recent = self.recent.write().await;
        if recent.as_deref() == Some(session_id) {
            *recent = None;
        }
        removed
    }
}

/// Stop the run, cancel the build, forget the session and remove its files
pub async fn delete(state: &AppState, session_id: &str) -> SimResult<()> {
    let session = state.sessions.get(session_id).await?;
    run::stop(&session).await;
    let active_job = session.lock().await.active_job.clone();
    if let Some(job_id) = active_job {
        jobs::cancel(&session, &job_id).await?;
    }
    state.sessions.remove(session_id).await;

    match tokio::fs::remove_dir_all(session.work_dir()).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(session_id, "Could not remove work dir: {}", e),
    }
    info!(session_id, "Session deleted");
    Ok(())
}

/// 8 hex digits, as used for session and job ids
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpsim_core::MotionProfile;

    fn scenario(n: usize) -> Scenario {
        let points = (0..n).map(|i| Waypoint::new(0.0, i as f64 * 0.001)).collect();
        Scenario::new(
            Route::new(points),
            MotionProfile::new(36.0, 2.0, 2.0),
        )
    }

    fn running(inner: &mut SessionInner, start: usize, end: usize) {
        inner.run = RunState {
            state: RunPhase::Running,
            active_range: Some(SegmentRange::new(start, end)),
            ..RunState::default()
        };
    }

    #[test]
    fn test_edits_without_run() {
        let mut inner = SessionInner {
            scenario: Some(scenario(3)),
            ..SessionInner::default()
        };
        inner.move_point(1, Waypoint::new(0.0005, 0.001)).unwrap();
        inner.insert_point(3, Waypoint::new(0.0, 0.004)).unwrap();
        let file = inner.delete_point(0).unwrap();
        assert_eq!(file.scenario.route.points.len(), 3);
        assert_eq!(file.schema_version, 1);
    }

    #[test]
    fn test_locked_waypoints() {
        let mut inner = SessionInner {
            scenario: Some(scenario(6)),
            ..SessionInner::default()
        };
        // segments 1..=2 lock waypoints 1, 2, 3
        running(&mut inner, 1, 2);

        for index in 1..=3 {
            let err = inner.move_point(index, Waypoint::new(0.001, 0.0)).unwrap_err();
            assert!(matches!(err, SimError::SegmentLocked { waypoint, start: 1, end: 2 } if waypoint == index));
            assert!(inner.delete_point(index).is_err());
        }
        inner.move_point(0, Waypoint::new(0.0, -0.001)).unwrap();
        inner.move_point(4, Waypoint::new(0.001, 0.004)).unwrap();

        // splitting a running segment is locked, splitting one after it is not
        assert!(matches!(
            inner.insert_point(2, Waypoint::new(0.0, 0.0015)),
            Err(SimError::SegmentLocked { .. })
        ));
        assert!(matches!(
            inner.insert_point(3, Waypoint::new(0.0, 0.0025)),
            Err(SimError::SegmentLocked { .. })
        ));
        inner.insert_point(4, Waypoint::new(0.0, 0.0035)).unwrap();
        inner.delete_point(4).unwrap();
    }

    #[test]
    fn test_edits_before_live_range_keep_numbering() {
        let mut inner = SessionInner {
            scenario: Some(scenario(6)),
            ..SessionInner::default()
        };
        running(&mut inner, 2, 3);
        let before = inner.scenario.clone();

        // waypoints 0 and 1 are free to move but not to disappear or gain a neighbour
        assert!(matches!(
            inner.insert_point(1, Waypoint::new(0.0, 0.0005)),
            Err(SimError::SegmentLocked { waypoint: 1, start: 2, end: 3 })
        ));
        assert!(matches!(
            inner.insert_point(0, Waypoint::new(0.0, -0.001)),
            Err(SimError::SegmentLocked { .. })
        ));
        assert!(matches!(
            inner.delete_point(0),
            Err(SimError::SegmentLocked { waypoint: 0, .. })
        ));
        assert_eq!(inner.scenario, before);

        inner.move_point(1, Waypoint::new(0.0001, 0.001)).unwrap();
        inner.insert_point(5, Waypoint::new(0.0, 0.0045)).unwrap();
        inner.delete_point(6).unwrap();
        let points = &inner.scenario.as_ref().unwrap().route.points;
        assert_eq!(points.len(), 6);
        assert_eq!(points[2..5], before.unwrap().route.points[2..5]);

        inner.run.state = RunPhase::Stopped;
        inner.delete_point(0).unwrap();
    }

    #[test]
    fn test_locks_end_with_run() {
        let mut inner = SessionInner {
            scenario: Some(scenario(4)),
            ..SessionInner::default()
        };
        running(&mut inner, 0, 1);
        assert!(inner.move_point(1, Waypoint::new(0.001, 0.001)).is_err());
        inner.run.state = RunPhase::Stopped;
        inner.move_point(1, Waypoint::new(0.001, 0.001)).unwrap();
    }

    #[test]
    fn test_replace_respects_locks() {
        let mut inner = SessionInner {
            scenario: Some(scenario(4)),
            ..SessionInner::default()
        };
        running(&mut inner, 2, 2);

        let mut file = inner.scenario_file().unwrap();
        file.scenario.route.points[0] = Waypoint::new(0.0001, 0.0);
        inner.replace_scenario(file.clone()).unwrap();

        file.scenario.route.points[3] = Waypoint::new(0.002, 0.003);
        let err = inner.replace_scenario(file).unwrap_err();
        assert!(matches!(err, SimError::SegmentLocked { waypoint: 3, .. }));
    }

    #[test]
    fn test_edit_validation() {
        let mut inner = SessionInner::default();
        assert!(matches!(inner.delete_point(0), Err(SimError::NotFound(_))));

        inner.scenario = Some(scenario(2));
        assert!(matches!(inner.delete_point(0), Err(SimError::InvalidRoute(_))));
        assert!(matches!(inner.move_point(5, Waypoint::new(0.0, 0.0)), Err(SimError::InvalidRoute(_))));
        assert!(matches!(
            inner.move_point(0, Waypoint::new(95.0, 0.0)),
            Err(SimError::InvalidRoute(_))
        ));
        // rejected edits leave the scenario alone
        assert_eq!(inner.scenario.as_ref().unwrap().route.points.len(), 2);
    }

    #[tokio::test]
    async fn test_manager_create_get_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path());
        let a = manager.create(Some("first".to_string())).await.unwrap();
        assert!(a.work_dir.is_dir());
        assert_eq!(a.session_id.len(), 8);
        let b = manager.create(None).await.unwrap();

        assert_eq!(manager.resolve(None).await.unwrap().id(), b.session_id);
        manager.resolve(Some(&a.session_id)).await.unwrap();
        assert_eq!(manager.resolve(None).await.unwrap().id(), a.session_id);
        assert_eq!(manager.list().await.len(), 2);
        assert!(matches!(manager.get("missing").await, Err(SimError::NotFound(_))));
    }
}
