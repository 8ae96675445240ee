//! IQ generation through the external `gps-sdr-sim` tool
//!
//! The trajectory is handed over as an LLH motion file (`t,lat,lon,alt` rows
//! at 10 Hz, the rate gps-sdr-sim steps user motion at):
//!
//! ```text
//! gps-sdr-sim -e <ephemeris> -o <iq> -s <rate> -b <bits> -x <llh> -d <secs> [-t <start> -T <start>]
//! ```

use crate::process::Supervised;
use async_trait::async_trait;
use gpsim_core::{DeviceError, GenerateOutcome, IqGenerator, IqRequest, MotionSample};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Motion file rate expected by gps-sdr-sim
pub const LLH_STEP_S: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct GpsSdrSimConfig {
    /// Executable name or path
    pub binary: PathBuf,
    /// RINEX navigation file
    pub ephemeris: PathBuf,
    pub grace: Duration,
}

pub struct GpsSdrSim {
    config: GpsSdrSimConfig,
}

impl GpsSdrSim {
    pub fn new(config: GpsSdrSimConfig) -> Self {
        Self { config }
    }

    pub fn args(&self, request: &IqRequest, llh_path: &Path) -> Vec<String> {
        let duration = request.trajectory.duration().ceil().max(1.0) as u64;
        let mut args = vec![
            "-e".to_string(),
            self.config.ephemeris.display().to_string(),
            "-o".to_string(),
            request.output_path.display().to_string(),
            "-s".to_string(),
            request.settings.iq_sample_rate_hz.to_string(),
            "-b".to_string(),
            request.settings.iq_bits.to_string(),
            "-x".to_string(),
            llh_path.display().to_string(),
            "-d".to_string(),
            duration.to_string(),
        ];
        if let Some(start) = &request.start_time {
            args.extend(["-t".to_string(), start.clone(), "-T".to_string(), start.clone()]);
        }
        args
    }
}

/// `<iq path>.traj` next to the output
pub fn llh_path_for(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".traj");
    PathBuf::from(name)
}

pub fn llh_rows(samples: &[MotionSample]) -> String {
    let mut out = String::with_capacity(samples.len() * 48);
    for s in samples {
        let _ = writeln!(out, "{:.3},{:.8},{:.8},{:.3}", s.t_s, s.lat, s.lon, s.alt_m);
    }
    out
}

fn ensure_file(path: &Path) -> Result<(), DeviceError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(DeviceError::MissingFile(path.display().to_string()))
    }
}

#[async_trait]
impl IqGenerator for GpsSdrSim {
    fn name(&self) -> &str {
        "gps-sdr-sim"
    }

    async fn generate(
        &self,
        request: IqRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateOutcome, DeviceError> {
        ensure_file(&self.config.ephemeris)?;
        // bare names are resolved through PATH at spawn time
        if self.config.binary.components().count() > 1 {
            ensure_file(&self.config.binary)?;
        }
        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let llh_path = llh_path_for(&request.output_path);
        let rows = llh_rows(&request.trajectory.resample(LLH_STEP_S));
        tokio::fs::write(&llh_path, rows).await?;

        let outcome = self.run_tool(&request, &llh_path, &cancel).await;
        if let Err(e) = tokio::fs::remove_file(&llh_path).await {
            warn!("Could not remove motion file {}: {}", llh_path.display(), e);
        }
        outcome
    }
}

impl GpsSdrSim {
    async fn run_tool(
        &self,
        request: &IqRequest,
        llh_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<GenerateOutcome, DeviceError> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.args(request, llh_path))
            .stdin(std::process::Stdio::null());
        info!(
            output = %request.output_path.display(),
            duration_s = request.trajectory.duration(),
            bits = request.settings.iq_bits,
            "Generating IQ"
        );

        let mut proc = Supervised::spawn(self.name(), cmd)?;
        tokio::select! {
            status = proc.wait() => match status {
                Ok(status) if status.success() => Ok(GenerateOutcome::Completed(request.output_path.clone())),
                Ok(status) => Err(proc.failure(status)),
                Err(e) => Err(DeviceError::Io(e)),
            },
            _ = cancel.cancelled() => {
                let terminated = proc.terminate(self.config.grace).await;
                if let Err(e) = tokio::fs::remove_file(&request.output_path).await {
                    warn!("Could not remove partial IQ file: {}", e);
                }
                terminated?;
                Ok(GenerateOutcome::Canceled)
            }
        }
    }
}

/// Stands in for gps-sdr-sim when IQ generation is disabled
///
/// Writes an empty IQ file so builds still produce both artifacts.
pub struct NullIqGenerator;

#[async_trait]
impl IqGenerator for NullIqGenerator {
    fn name(&self) -> &str {
        "null"
    }

    async fn generate(
        &self,
        request: IqRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateOutcome, DeviceError> {
        if cancel.is_cancelled() {
            return Ok(GenerateOutcome::Canceled);
        }
        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&request.output_path, b"").await?;
        Ok(GenerateOutcome::Completed(request.output_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpsim_core::settings::IqGeneratorSettings;
    use gpsim_core::{integrate, MotionProfile, Route, Trajectory, Waypoint};
    use std::sync::Arc;

    fn trajectory() -> Arc<Trajectory> {
        let route = Route::new(vec![Waypoint::new(10.0, 106.0), Waypoint::new(10.0005, 106.0)]);
        let profile = MotionProfile {
            cruise_speed_kmh: 36.0,
            accel_mps2: 2.0,
            decel_mps2: 2.0,
            turn_slowdown_factor_per_deg: 0.0,
            min_turn_speed_kmh: 0.0,
            turn_rate_deg_s: 0.0,
            start_hold_s: 0.0,
            start_speed_kmh: 0.0,
            start_speed_s: 0.0,
        };
        Arc::new(integrate(&route, &profile, 0.1).unwrap())
    }

    fn request(output: PathBuf, start_time: Option<&str>) -> IqRequest {
        IqRequest {
            trajectory: trajectory(),
            output_path: output,
            settings: IqGeneratorSettings::default(),
            start_time: start_time.map(str::to_string),
        }
    }

    fn sim(binary: &str, ephemeris: PathBuf) -> GpsSdrSim {
        GpsSdrSim::new(GpsSdrSimConfig {
            binary: PathBuf::from(binary),
            ephemeris,
            grace: Duration::from_millis(500),
        })
    }

    #[test]
    fn test_args() {
        let sim = sim("gps-sdr-sim", PathBuf::from("brdc0010.22n"));
        let req = request(PathBuf::from("out/route.iq"), Some("2024/01/02,03:04:05"));
        let args = sim.args(&req, Path::new("out/route.iq.traj"));
        let duration = (req.trajectory.duration().ceil() as u64).to_string();
        let expected: Vec<String> = [
            "-e", "brdc0010.22n", "-o", "out/route.iq", "-s", "2600000", "-b", "8",
            "-x", "out/route.iq.traj", "-d", duration.as_str(),
            "-t", "2024/01/02,03:04:05", "-T", "2024/01/02,03:04:05",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn test_llh_rows_format() {
        let rows = llh_rows(&trajectory().resample(LLH_STEP_S));
        let first = rows.lines().next().unwrap();
        assert_eq!(first, "0.000,10.00000000,106.00000000,0.000");
        assert_eq!(rows.lines().nth(1).unwrap().split(',').next().unwrap(), "0.100");
    }

    #[test]
    fn test_llh_path() {
        assert_eq!(llh_path_for(Path::new("/tmp/a/route.iq")), PathBuf::from("/tmp/a/route.iq.traj"));
    }

    #[tokio::test]
    async fn test_missing_ephemeris() {
        let dir = tempfile::tempdir().unwrap();
        let sim = sim("gps-sdr-sim", dir.path().join("missing.22n"));
        let err = sim
            .generate(request(dir.path().join("route.iq"), None), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::MissingFile(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let eph = dir.path().join("brdc.22n");
        std::fs::write(&eph, "").unwrap();
        let sim = sim("false", eph);
        let err = sim
            .generate(request(dir.path().join("route.iq"), None), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::ProcessFailed { code: Some(1), .. }));
        assert!(!dir.path().join("route.iq.traj").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_tool() {
        let dir = tempfile::tempdir().unwrap();
        // `sh -e <ephemeris> ...` runs the ephemeris file as a script
        let eph = dir.path().join("brdc.22n");
        std::fs::write(&eph, "exec sleep 30\n").unwrap();
        let sim = sim("sh", eph);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let outcome = sim
            .generate(request(dir.path().join("route.iq"), None), cancel)
            .await
            .unwrap();
        assert_eq!(outcome, GenerateOutcome::Canceled);
        assert!(!dir.path().join("route.iq.traj").exists());
        assert!(!dir.path().join("route.iq").exists());
    }

    #[tokio::test]
    async fn test_launch_failure_removes_motion_file() {
        let dir = tempfile::tempdir().unwrap();
        let eph = dir.path().join("brdc.22n");
        std::fs::write(&eph, "").unwrap();
        let sim = sim("gpsim-no-such-tool", eph);
        let err = sim
            .generate(request(dir.path().join("route.iq"), None), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Launch { .. }));
        assert!(!dir.path().join("route.iq.traj").exists());
    }

    #[tokio::test]
    async fn test_null_generator_writes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out/route.iq");
        let outcome = NullIqGenerator
            .generate(request(out.clone(), None), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, GenerateOutcome::Completed(out.clone()));
        assert_eq!(std::fs::metadata(&out).unwrap().len(), 0);
    }
}
