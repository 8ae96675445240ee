//! Server configuration from `GPSIM_*` environment variables

use anyhow::{Context, Result};
use gpsim_devices::ToolPaths;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_STOP_GRACE_MS: u64 = 3000;
const DEFAULT_TELEMETRY_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Each session gets `<session_root>/<session_id>/`
    pub session_root: PathBuf,
    /// Operator settings (YAML)
    pub settings_path: PathBuf,
    pub tools: ToolPaths,
    /// Run gps-sdr-sim during builds; when off an empty IQ file is written
    pub enable_iq: bool,
    /// Use recording devices instead of the radio and serial port
    pub dry_run: bool,
    /// How long a subprocess gets between SIGTERM and SIGKILL
    pub stop_grace: Duration,
    pub telemetry_capacity: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind = var("GPSIM_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse()
            .context("parsing GPSIM_BIND")?;

        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gpsim");
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gpsim");

        let stop_grace_ms = match var("GPSIM_STOP_GRACE_MS") {
            Some(raw) => raw.parse().context("parsing GPSIM_STOP_GRACE_MS")?,
            None => DEFAULT_STOP_GRACE_MS,
        };
        let telemetry_capacity = match var("GPSIM_TELEMETRY_CAPACITY") {
            Some(raw) => raw.parse().context("parsing GPSIM_TELEMETRY_CAPACITY")?,
            None => DEFAULT_TELEMETRY_CAPACITY,
        };
        if telemetry_capacity == 0 {
            anyhow::bail!("GPSIM_TELEMETRY_CAPACITY must be > 0");
        }

        Ok(Self {
            bind,
            session_root: var("GPSIM_SESSION_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("sessions")),
            settings_path: var("GPSIM_SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| config_dir.join("settings.yaml")),
            tools: ToolPaths {
                gps_sdr_sim: PathBuf::from(
                    var("GPSIM_GPS_SDR_SIM_PATH").unwrap_or_else(|| "gps-sdr-sim".to_string()),
                ),
                ephemeris: var("GPSIM_EPHEMERIS_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| data_dir.join("ephemeris").join("brdc0010.22n")),
                hackrf_transfer: PathBuf::from(
                    var("GPSIM_HACKRF_TRANSFER_PATH")
                        .unwrap_or_else(|| "hackrf_transfer".to_string()),
                ),
            },
            enable_iq: var("GPSIM_ENABLE_IQ").map(|v| flag(&v)).unwrap_or(true),
            dry_run: var("GPSIM_DRY_RUN").map(|v| flag(&v)).unwrap_or(false),
            stop_grace: Duration::from_millis(stop_grace_ms),
            telemetry_capacity,
        })
    }

    /// Self-contained dry-run configuration rooted at `dir`
    pub fn local(dir: &Path) -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            session_root: dir.join("sessions"),
            settings_path: dir.join("settings.yaml"),
            tools: ToolPaths {
                gps_sdr_sim: PathBuf::from("gps-sdr-sim"),
                ephemeris: dir.join("brdc0010.22n"),
                hackrf_transfer: PathBuf::from("hackrf_transfer"),
            },
            enable_iq: false,
            dry_run: true,
            stop_grace: Duration::from_millis(200),
            telemetry_capacity: DEFAULT_TELEMETRY_CAPACITY,
        }
    }
}

/// Anything but `0`, `false`, `no`, `off` enables a flag
fn flag(raw: &str) -> bool {
    !matches!(raw.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind.port(), 8000);
        assert!(cfg.enable_iq);
        assert!(!cfg.dry_run);
        assert_eq!(cfg.stop_grace, Duration::from_millis(3000));
        assert_eq!(cfg.tools.gps_sdr_sim, PathBuf::from("gps-sdr-sim"));
        assert!(cfg.session_root.ends_with("gpsim/sessions"));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("GPSIM_BIND", "127.0.0.1:9000"),
            ("GPSIM_SESSION_ROOT", "/tmp/gpsim"),
            ("GPSIM_ENABLE_IQ", "Off"),
            ("GPSIM_DRY_RUN", "1"),
            ("GPSIM_STOP_GRACE_MS", "500"),
        ])
        .unwrap();
        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.session_root, PathBuf::from("/tmp/gpsim"));
        assert!(!cfg.enable_iq);
        assert!(cfg.dry_run);
        assert_eq!(cfg.stop_grace, Duration::from_millis(500));
    }

    #[test]
    fn test_bad_values() {
        assert!(config(&[("GPSIM_BIND", "not an address")]).is_err());
        assert!(config(&[("GPSIM_STOP_GRACE_MS", "-1")]).is_err());
        assert!(config(&[("GPSIM_TELEMETRY_CAPACITY", "0")]).is_err());
    }
}
