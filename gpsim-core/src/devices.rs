//! Device adapter traits
//!
//! The server drives three kinds of external collaborators:
//! - an IQ generator that renders a trajectory into a baseband sample file
//! - a GPS transmitter that plays such a file through the radio
//! - a motion controller that receives speed/bearing commands over serial
//!
//! Concrete adapters (subprocess, serial, dry-run) live in `gpsim-devices`.

use crate::error::DeviceError;
use crate::settings::{AppSettings, ControllerSettings, IqGeneratorSettings};
use crate::trajectory::Trajectory;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything an IQ generator needs for one build
#[derive(Debug, Clone)]
pub struct IqRequest {
    pub trajectory: Arc<Trajectory>,
    pub output_path: PathBuf,
    pub settings: IqGeneratorSettings,
    /// Already in the tool's `YYYY/MM/DD,hh:mm:ss` form
    pub start_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    Completed(PathBuf),
    Canceled,
}

/// Trait for IQ file generators
#[async_trait]
pub trait IqGenerator: Send + Sync {
    /// Get the name of this generator (e.g., "gps-sdr-sim")
    fn name(&self) -> &str;

    /// Render `request.trajectory` into `request.output_path`
    ///
    /// Must return promptly with [`GenerateOutcome::Canceled`] once `cancel`
    /// fires, after any child process has exited.
    async fn generate(
        &self,
        request: IqRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateOutcome, DeviceError>;
}

/// Sample layout of an IQ file, used to seek into it by time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IqLayout {
    pub bits: u8,
    pub sample_rate_hz: u32,
}

impl IqLayout {
    pub fn from_settings(settings: &IqGeneratorSettings) -> Self {
        Self {
            bits: settings.iq_bits,
            sample_rate_hz: settings.iq_sample_rate_hz,
        }
    }

    /// gps-sdr-sim packs four 1-bit I/Q pairs into each byte
    pub fn pairs_per_byte(&self) -> u64 {
        if self.bits == 1 {
            4
        } else {
            1
        }
    }

    /// Bytes per interleaved I/Q pair, or per packed byte for 1-bit files
    pub fn bytes_per_pair(&self) -> u64 {
        (2 * u64::from(self.bits / 8)).max(1)
    }

    /// Index of the first I/Q pair of the whole byte containing time `t_s`
    fn aligned_pair(&self, t_s: f64) -> u64 {
        let index = (t_s.max(0.0) * f64::from(self.sample_rate_hz)).floor() as u64;
        index - index % self.pairs_per_byte()
    }

    /// Byte offset of the whole byte that holds the I/Q pair at `t_s`
    pub fn byte_offset(&self, t_s: f64) -> u64 {
        self.aligned_pair(t_s) / self.pairs_per_byte() * self.bytes_per_pair()
    }

    /// `t_s` rounded down to the time of [`IqLayout::byte_offset`]
    pub fn aligned_start(&self, t_s: f64) -> f64 {
        if self.sample_rate_hz == 0 {
            return t_s.max(0.0);
        }
        self.aligned_pair(t_s) as f64 / f64::from(self.sample_rate_hz)
    }

    /// Portion of `path` covering `[t0, t1]` seconds
    ///
    /// Playback begins at [`IqLayout::aligned_start`] of `t0`, which is at
    /// most one byte of samples earlier.
    pub fn slice(&self, path: PathBuf, t0: f64, t1: f64) -> IqSource {
        let offset_bytes = self.byte_offset(t0);
        let end = self.byte_offset(t1);
        IqSource {
            path,
            offset_bytes,
            length_bytes: Some(end.saturating_sub(offset_bytes)),
            duration_s: (t1 - self.aligned_start(t0)).max(0.0),
        }
    }
}

/// Byte range of an IQ file handed to the transmitter
#[derive(Debug, Clone, PartialEq)]
pub struct IqSource {
    pub path: PathBuf,
    pub offset_bytes: u64,
    /// `None` plays to the end of the file
    pub length_bytes: Option<u64>,
    /// Playback time the range represents
    pub duration_s: f64,
}

impl IqSource {
    pub fn whole_file(&self) -> bool {
        self.offset_bytes == 0 && self.length_bytes.is_none()
    }
}

/// Handle to a running transmission
#[async_trait]
pub trait Transmission: Send {
    /// OS process id, if the transmission is backed by one
    fn id(&self) -> Option<u32>;

    /// Wait for the transmission to end on its own
    ///
    /// `Ok` on a clean exit; a radio held by another process is reported as
    /// [`DeviceError::Busy`].
    async fn wait(&mut self) -> Result<(), DeviceError>;

    /// Terminate, wait up to `grace`, then force-kill and reap
    async fn shutdown(&mut self, grace: Duration) -> Result<(), DeviceError>;

    fn is_alive(&mut self) -> bool;
}

/// Trait for radio transmitters
#[async_trait]
pub trait GpsTransmitter: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, source: IqSource) -> Result<Box<dyn Transmission>, DeviceError>;
}

/// One feed tick for the motion controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionCommand {
    pub speed_kmh: f64,
    pub bearing_deg: f64,
}

/// Trait for the serial speed/bearing controller
#[async_trait]
pub trait MotionController: Send {
    fn name(&self) -> &str;

    /// Tell the controller which heading the vehicle starts on
    async fn calibrate_heading(&mut self, bearing_deg: f64) -> Result<(), DeviceError>;

    async fn send(&mut self, command: MotionCommand) -> Result<(), DeviceError>;

    /// Stop both speed and heading actuators
    async fn halt(&mut self) -> Result<(), DeviceError>;

    /// Halt and release the port
    async fn close(&mut self) -> Result<(), DeviceError>;
}

/// Builds adapters for the current settings
///
/// Settings are editable at runtime, so adapters are created per build/run
/// rather than once at startup.
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    fn iq_generator(&self, settings: &AppSettings) -> Box<dyn IqGenerator>;

    fn transmitter(&self, settings: &AppSettings) -> Box<dyn GpsTransmitter>;

    async fn open_controller(
        &self,
        settings: &ControllerSettings,
    ) -> Result<Box<dyn MotionController>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_offsets() {
        let eight = IqLayout { bits: 8, sample_rate_hz: 2_600_000 };
        assert_eq!(eight.byte_offset(1.0), 5_200_000);
        let sixteen = IqLayout { bits: 16, sample_rate_hz: 2_600_000 };
        assert_eq!(sixteen.byte_offset(0.5), 5_200_000);
        assert_eq!(sixteen.byte_offset(-3.0), 0);
    }

    #[test]
    fn test_slice() {
        let layout = IqLayout { bits: 8, sample_rate_hz: 1_000 };
        let src = layout.slice(PathBuf::from("route.iq"), 2.0, 5.5);
        assert_eq!(src.offset_bytes, 4_000);
        assert_eq!(src.length_bytes, Some(7_000));
        assert_eq!(src.duration_s, 3.5);
        assert_eq!(layout.aligned_start(2.0), 2.0);
        assert!(!src.whole_file());
    }

    #[test]
    fn test_one_bit_seeks_on_byte_boundaries() {
        let layout = IqLayout { bits: 1, sample_rate_hz: 2_600_000 };
        let src = layout.slice(PathBuf::from("route.iq"), 10.0, 20.0);
        assert_eq!(src.offset_bytes, 6_500_000);
        assert_eq!(src.length_bytes, Some(6_500_000));
        assert_eq!(src.duration_s, 10.0);
        assert!(!src.whole_file());

        // pairs 0..4 share byte 0, pairs 4..8 share byte 1
        let layout = IqLayout { bits: 1, sample_rate_hz: 1_000 };
        assert_eq!(layout.byte_offset(0.003), 0);
        assert_eq!(layout.aligned_start(0.003), 0.0);
        assert_eq!(layout.byte_offset(0.006), 1);
        assert_eq!(layout.aligned_start(0.006), 0.004);
        let src = layout.slice(PathBuf::from("route.iq"), 0.006, 1.0);
        assert_eq!(src.offset_bytes, 1);
        assert_eq!(src.length_bytes, Some(249));
        assert!((src.duration_s - 0.996).abs() < 1e-9);
    }
}
