//! Application state management

use crate::config::ServerConfig;
use crate::sessions::SessionManager;
use crate::settings::SettingsStore;
use crate::telemetry::Telemetry;
use gpsim_core::DeviceFactory;
use gpsim_devices::{DryRunDevices, HardwareDevices};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,

    /// Operator settings, read at each build and run
    pub settings: Arc<SettingsStore>,

    pub sessions: Arc<SessionManager>,

    /// Fan-out of state/status/data events to WebSocket and SSE clients
    pub telemetry: Telemetry,

    pub devices: Arc<dyn DeviceFactory>,

    /// One permit: the radio and the serial controller are used by one run
    /// at a time, across all sessions
    pub device_lock: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: ServerConfig, devices: Arc<dyn DeviceFactory>) -> Self {
        let settings = SettingsStore::open(&config.settings_path);
        Self {
            settings: Arc::new(settings),
            sessions: Arc::new(SessionManager::new(&config.session_root)),
            telemetry: Telemetry::new(config.telemetry_capacity),
            devices,
            device_lock: Arc::new(Semaphore::new(1)),
            config: Arc::new(config),
        }
    }

    /// Pick hardware or dry-run devices from the configuration
    pub fn from_config(config: ServerConfig) -> Self {
        let devices: Arc<dyn DeviceFactory> = if config.dry_run {
            info!("Dry-run mode: no radio or serial port will be used");
            Arc::new(DryRunDevices::new())
        } else {
            info!(
                gps_sdr_sim = %config.tools.gps_sdr_sim.display(),
                hackrf_transfer = %config.tools.hackrf_transfer.display(),
                iq_enabled = config.enable_iq,
                "Hardware devices"
            );
            Arc::new(HardwareDevices::new(
                config.tools.clone(),
                config.enable_iq,
                config.stop_grace,
            ))
        };
        Self::new(config, devices)
    }
}
