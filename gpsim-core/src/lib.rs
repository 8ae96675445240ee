//! gpsim core library
//!
//! Route and scenario model, the motion-profile integrator, and the device
//! traits the server uses to drive the IQ generator, the radio transmitter
//! and the serial motion controller.

pub mod devices;
pub mod error;
pub mod geo;
pub mod model;
pub mod motion_table;
pub mod settings;
pub mod trajectory;
pub mod units;

pub use devices::{
    DeviceFactory, GenerateOutcome, GpsTransmitter, IqGenerator, IqLayout, IqRequest, IqSource,
    MotionCommand, MotionController, Transmission,
};
pub use error::{DeviceError, SimError, SimResult};
pub use model::{
    MotionProfile, MotionProfileSpec, MotionSample, Route, Scenario, ScenarioFile, ScenarioMeta,
    SegmentRange, TelemetryFrame, Waypoint,
};
pub use settings::AppSettings;
pub use trajectory::{integrate, Trajectory};
