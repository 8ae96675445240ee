//! Factory for the real tool chain: gps-sdr-sim, hackrf_transfer, serial port

use crate::gps_sdr_sim::{GpsSdrSim, GpsSdrSimConfig, NullIqGenerator};
use crate::hackrf::{HackRfConfig, HackRfTransmitter};
use crate::serial::SerialController;
use async_trait::async_trait;
use gpsim_core::settings::{AppSettings, ControllerSettings};
use gpsim_core::{DeviceError, DeviceFactory, GpsTransmitter, IqGenerator, MotionController};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub gps_sdr_sim: PathBuf,
    pub ephemeris: PathBuf,
    pub hackrf_transfer: PathBuf,
}

pub struct HardwareDevices {
    tools: ToolPaths,
    /// When off, builds write an empty IQ file instead of running gps-sdr-sim
    iq_enabled: bool,
    grace: Duration,
}

impl HardwareDevices {
    pub fn new(tools: ToolPaths, iq_enabled: bool, grace: Duration) -> Self {
        Self {
            tools,
            iq_enabled,
            grace,
        }
    }
}

#[async_trait]
impl DeviceFactory for HardwareDevices {
    fn iq_generator(&self, _settings: &AppSettings) -> Box<dyn IqGenerator> {
        if !self.iq_enabled {
            return Box::new(NullIqGenerator);
        }
        Box::new(GpsSdrSim::new(GpsSdrSimConfig {
            binary: self.tools.gps_sdr_sim.clone(),
            ephemeris: self.tools.ephemeris.clone(),
            grace: self.grace,
        }))
    }

    fn transmitter(&self, settings: &AppSettings) -> Box<dyn GpsTransmitter> {
        Box::new(HackRfTransmitter::new(HackRfConfig {
            binary: self.tools.hackrf_transfer.clone(),
            radio: settings.gps_transmitter.clone(),
        }))
    }

    async fn open_controller(
        &self,
        settings: &ControllerSettings,
    ) -> Result<Box<dyn MotionController>, DeviceError> {
        Ok(Box::new(SerialController::open(settings).await?))
    }
}
