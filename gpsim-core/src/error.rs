//! Error types shared by the integrator, device adapters and server

use std::io;
use thiserror::Error;

/// Result type for simulator operations
pub type SimResult<T> = Result<T, SimError>;

/// Errors surfaced to API clients
#[derive(Error, Debug)]
pub enum SimError {
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("invalid motion profile: {0}")]
    InvalidProfile(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("a build job is already in progress for this session")]
    BuildInProgress,

    #[error("a run is already in progress for this session")]
    RunInProgress,

    #[error("cannot build while a run is waiting or running")]
    RunActive,

    #[error("no completed build available for this session")]
    BuildNotReady,

    #[error("the latest build does not match the current scenario; rebuild first")]
    BuildOutdated,

    /// Waypoint edit touching the segment window of a running playback
    #[error("waypoint {waypoint} is locked by the running segments {start}..={end}")]
    SegmentLocked {
        waypoint: usize,
        start: usize,
        end: usize,
    },

    #[error("subprocess failed: {0}")]
    SubprocessFailure(String),

    #[error("radio device is busy: {0}")]
    DeviceBusy(String),

    #[error("serial I/O error: {0}")]
    SerialIo(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SimError {
    /// Stable machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            SimError::InvalidRoute(_) => "invalid_route",
            SimError::InvalidProfile(_) => "invalid_profile",
            SimError::InvalidRequest(_) => "invalid_request",
            SimError::BuildInProgress => "build_in_progress",
            SimError::RunInProgress => "run_in_progress",
            SimError::RunActive => "run_active",
            SimError::BuildNotReady => "build_not_ready",
            SimError::BuildOutdated => "build_outdated",
            SimError::SegmentLocked { .. } => "segment_locked",
            SimError::SubprocessFailure(_) => "subprocess_failure",
            SimError::DeviceBusy(_) => "device_busy",
            SimError::SerialIo(_) => "serial_io",
            SimError::NotFound(_) => "not_found",
            SimError::Io(_) => "io",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SimError::InvalidRoute(_) | SimError::InvalidProfile(_) | SimError::InvalidRequest(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SimError::BuildInProgress
                | SimError::RunInProgress
                | SimError::RunActive
                | SimError::BuildNotReady
                | SimError::BuildOutdated
                | SimError::SegmentLocked { .. }
        )
    }
}

/// Failures reported by device adapters
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The radio is held by another process
    #[error("{0}")]
    Busy(String),

    #[error("{tool} exited with code {code:?}: {detail}")]
    ProcessFailed {
        tool: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("serial port {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("required file missing: {0}")]
    MissingFile(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<DeviceError> for SimError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Busy(msg) => SimError::DeviceBusy(msg),
            DeviceError::Serial { .. } => SimError::SerialIo(err.to_string()),
            other => SimError::SubprocessFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_mapping() {
        let busy: SimError = DeviceError::Busy("hackrf_open() failed".into()).into();
        assert!(matches!(busy, SimError::DeviceBusy(_)));
        assert_eq!(busy.code(), "device_busy");

        let serial: SimError = DeviceError::Serial {
            port: "/dev/ttyUSB0".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
        }
        .into();
        assert!(matches!(serial, SimError::SerialIo(_)));

        let failed: SimError = DeviceError::ProcessFailed {
            tool: "gps-sdr-sim".into(),
            code: Some(1),
            detail: "bad ephemeris".into(),
        }
        .into();
        assert!(matches!(failed, SimError::SubprocessFailure(ref m) if m.contains("bad ephemeris")));
    }

    #[test]
    fn test_classification() {
        assert!(SimError::InvalidRoute("x".into()).is_validation());
        assert!(SimError::SegmentLocked { waypoint: 1, start: 0, end: 1 }.is_conflict());
        assert!(!SimError::DeviceBusy("x".into()).is_conflict());
    }
}
