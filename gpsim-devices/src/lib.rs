//! Device adapters for gpsim
//!
//! - `gps_sdr_sim`: IQ generation subprocess
//! - `hackrf`: radio transmission subprocess
//! - `serial`: speed/bearing controller line protocol
//! - `dry_run`: stand-ins that record instead of touching hardware

pub mod dry_run;
pub mod gps_sdr_sim;
pub mod hackrf;
pub mod hardware;
pub mod process;
pub mod serial;

pub use dry_run::{ControllerEvent, DryRunDevices, DryRunLog, TransmitterBehavior};
pub use gps_sdr_sim::{GpsSdrSim, GpsSdrSimConfig, NullIqGenerator};
pub use hackrf::{HackRfConfig, HackRfTransmitter};
pub use hardware::{HardwareDevices, ToolPaths};
pub use serial::SerialController;
