//! Dry-run devices: no radio, no serial port
//!
//! Used when the server runs without hardware, and by tests. Controller
//! traffic and transmissions are recorded in a shared [`DryRunLog`].

use crate::gps_sdr_sim::NullIqGenerator;
use async_trait::async_trait;
use gpsim_core::settings::{AppSettings, ControllerSettings};
use gpsim_core::{
    DeviceError, DeviceFactory, GpsTransmitter, IqGenerator, IqSource, MotionCommand,
    MotionController, Transmission,
};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Calibrate(f64),
    Command(MotionCommand),
    Halt,
    Close,
}

/// How a dry-run transmission ends
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransmitterBehavior {
    /// Runs until shut down
    RunUntilStopped,
    /// Exits cleanly once the IQ range has played
    PlayToEnd,
    /// Exits non-zero after the delay
    FailAfter(Duration),
    /// Reports the radio as held by another process
    Busy,
}

#[derive(Clone, Default)]
pub struct DryRunLog {
    events: Arc<Mutex<Vec<ControllerEvent>>>,
    transmissions: Arc<Mutex<Vec<IqSource>>>,
    alive: Arc<AtomicUsize>,
}

impl DryRunLog {
    pub fn controller_events(&self) -> Vec<ControllerEvent> {
        self.events.lock().clone()
    }

    pub fn commands(&self) -> Vec<MotionCommand> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ControllerEvent::Command(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    pub fn transmissions(&self) -> Vec<IqSource> {
        self.transmissions.lock().clone()
    }

    /// Transmissions started and not yet ended or shut down
    pub fn alive_transmissions(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }
}

pub struct DryRunTransmitter {
    log: DryRunLog,
    behavior: TransmitterBehavior,
}

static NEXT_DRY_RUN_ID: AtomicU32 = AtomicU32::new(1);

#[async_trait]
impl GpsTransmitter for DryRunTransmitter {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn start(&self, source: IqSource) -> Result<Box<dyn Transmission>, DeviceError> {
        info!(
            path = %source.path.display(),
            offset = source.offset_bytes,
            duration_s = source.duration_s,
            "Dry-run transmission started"
        );
        let duration = Duration::from_secs_f64(source.duration_s.max(0.0));
        self.log.transmissions.lock().push(source);
        self.log.alive.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(DryRunTransmission {
            id: NEXT_DRY_RUN_ID.fetch_add(1, Ordering::Relaxed),
            log: self.log.clone(),
            behavior: self.behavior,
            started: tokio::time::Instant::now(),
            duration,
            alive: true,
        }))
    }
}

struct DryRunTransmission {
    id: u32,
    log: DryRunLog,
    behavior: TransmitterBehavior,
    started: tokio::time::Instant,
    duration: Duration,
    alive: bool,
}

impl DryRunTransmission {
    fn mark_ended(&mut self) {
        if self.alive {
            self.alive = false;
            self.log.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Transmission for DryRunTransmission {
    fn id(&self) -> Option<u32> {
        Some(self.id)
    }

    async fn wait(&mut self) -> Result<(), DeviceError> {
        if !self.alive {
            return Ok(());
        }
        match self.behavior {
            TransmitterBehavior::RunUntilStopped => {
                std::future::pending::<Result<(), DeviceError>>().await
            }
            TransmitterBehavior::PlayToEnd => {
                tokio::time::sleep_until(self.started + self.duration).await;
                self.mark_ended();
                Ok(())
            }
            TransmitterBehavior::FailAfter(delay) => {
                tokio::time::sleep_until(self.started + delay).await;
                self.mark_ended();
                Err(DeviceError::ProcessFailed {
                    tool: "dry-run".to_string(),
                    code: Some(1),
                    detail: "simulated transmitter failure".to_string(),
                })
            }
            TransmitterBehavior::Busy => {
                self.mark_ended();
                Err(DeviceError::Busy(
                    "hackrf_open() failed: Resource busy (-1000)".to_string(),
                ))
            }
        }
    }

    async fn shutdown(&mut self, _grace: Duration) -> Result<(), DeviceError> {
        self.mark_ended();
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }
}

impl Drop for DryRunTransmission {
    fn drop(&mut self) {
        self.mark_ended();
    }
}

pub struct RecordingController {
    log: DryRunLog,
    /// Fail the n-th `send` (1-based) with a serial error
    fail_on_send: Option<usize>,
    sent: usize,
}

#[async_trait]
impl MotionController for RecordingController {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn calibrate_heading(&mut self, bearing_deg: f64) -> Result<(), DeviceError> {
        self.log.events.lock().push(ControllerEvent::Calibrate(bearing_deg));
        Ok(())
    }

    async fn send(&mut self, command: MotionCommand) -> Result<(), DeviceError> {
        self.sent += 1;
        if self.fail_on_send == Some(self.sent) {
            return Err(DeviceError::Serial {
                port: "dry-run".to_string(),
                source: io::Error::new(io::ErrorKind::BrokenPipe, "simulated serial failure"),
            });
        }
        self.log.events.lock().push(ControllerEvent::Command(command));
        Ok(())
    }

    async fn halt(&mut self) -> Result<(), DeviceError> {
        self.log.events.lock().push(ControllerEvent::Halt);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        let mut events = self.log.events.lock();
        events.push(ControllerEvent::Halt);
        events.push(ControllerEvent::Close);
        Ok(())
    }
}

/// Factory handing out dry-run devices that share one log
#[derive(Clone)]
pub struct DryRunDevices {
    log: DryRunLog,
    transmitter: TransmitterBehavior,
    fail_on_send: Option<usize>,
}

impl DryRunDevices {
    pub fn new() -> Self {
        Self {
            log: DryRunLog::default(),
            transmitter: TransmitterBehavior::RunUntilStopped,
            fail_on_send: None,
        }
    }

    pub fn with_transmitter(mut self, behavior: TransmitterBehavior) -> Self {
        self.transmitter = behavior;
        self
    }

    pub fn with_serial_failure_on_send(mut self, nth: usize) -> Self {
        self.fail_on_send = Some(nth);
        self
    }

    pub fn log(&self) -> DryRunLog {
        self.log.clone()
    }
}

impl Default for DryRunDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceFactory for DryRunDevices {
    fn iq_generator(&self, _settings: &AppSettings) -> Box<dyn IqGenerator> {
        Box::new(NullIqGenerator)
    }

    fn transmitter(&self, _settings: &AppSettings) -> Box<dyn GpsTransmitter> {
        Box::new(DryRunTransmitter {
            log: self.log.clone(),
            behavior: self.transmitter,
        })
    }

    async fn open_controller(
        &self,
        settings: &ControllerSettings,
    ) -> Result<Box<dyn MotionController>, DeviceError> {
        info!(port = %settings.port, "Dry-run motion controller opened");
        Ok(Box::new(RecordingController {
            log: self.log.clone(),
            fail_on_send: self.fail_on_send,
            sent: 0,
        }))
    }
}
