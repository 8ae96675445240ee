//! Transmission through `hackrf_transfer`
//!
//! Whole files are passed by path. A byte range is streamed into the tool's
//! stdin (`-t -`) from a seeked and length-limited file reader.

use crate::process::Supervised;
use async_trait::async_trait;
use gpsim_core::settings::GpsTransmitterSettings;
use gpsim_core::{DeviceError, GpsTransmitter, IqSource, Transmission};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Printed by hackrf_transfer when the radio is missing or held elsewhere
pub const BUSY_MARKER: &str = "hackrf_open() failed";

#[derive(Debug, Clone)]
pub struct HackRfConfig {
    pub binary: PathBuf,
    pub radio: GpsTransmitterSettings,
}

pub struct HackRfTransmitter {
    config: HackRfConfig,
}

impl HackRfTransmitter {
    pub fn new(config: HackRfConfig) -> Self {
        Self { config }
    }

    pub fn args(&self, input: &str) -> Vec<String> {
        let radio = &self.config.radio;
        vec![
            "-t".to_string(),
            input.to_string(),
            "-f".to_string(),
            radio.center_freq_hz.to_string(),
            "-s".to_string(),
            radio.sample_rate_hz.to_string(),
            "-x".to_string(),
            radio.txvga_gain.to_string(),
            "-a".to_string(),
            if radio.amp_enabled { "1" } else { "0" }.to_string(),
        ]
    }
}

#[async_trait]
impl GpsTransmitter for HackRfTransmitter {
    fn name(&self) -> &str {
        "hackrf_transfer"
    }

    async fn start(&self, source: IqSource) -> Result<Box<dyn Transmission>, DeviceError> {
        if !source.path.is_file() {
            return Err(DeviceError::MissingFile(source.path.display().to_string()));
        }

        let streamed = !source.whole_file();
        let input = if streamed {
            "-".to_string()
        } else {
            source.path.display().to_string()
        };

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.args(&input))
            .stdin(if streamed { Stdio::piped() } else { Stdio::null() });
        let mut proc = Supervised::spawn(self.name(), cmd)?;

        let feeder = if streamed {
            let stdin = proc.child_mut().stdin.take();
            stdin.map(|mut stdin| {
                let source = source.clone();
                tokio::spawn(async move {
                    let mut file = match tokio::fs::File::open(&source.path).await {
                        Ok(f) => f,
                        Err(e) => {
                            warn!("Cannot open IQ file {}: {}", source.path.display(), e);
                            return;
                        }
                    };
                    if let Err(e) = file.seek(SeekFrom::Start(source.offset_bytes)).await {
                        warn!("Cannot seek IQ file: {}", e);
                        return;
                    }
                    let limit = source.length_bytes.unwrap_or(u64::MAX);
                    let mut reader = file.take(limit);
                    match tokio::io::copy(&mut reader, &mut stdin).await {
                        Ok(bytes) => debug!(bytes, "IQ stream finished"),
                        // the tool closes its end on shutdown
                        Err(e) => debug!("IQ stream ended: {}", e),
                    }
                })
            })
        } else {
            None
        };

        info!(
            pid = ?proc.id(),
            path = %source.path.display(),
            offset = source.offset_bytes,
            length = ?source.length_bytes,
            "Transmitter started"
        );

        Ok(Box::new(HackRfTransmission { proc, feeder }))
    }
}

/// A busy radio takes precedence over the exit code
fn exit_result(tool: &str, status: ExitStatus, stderr_tail: String) -> Result<(), DeviceError> {
    if stderr_tail.contains(BUSY_MARKER) {
        return Err(DeviceError::Busy(stderr_tail));
    }
    if status.success() {
        Ok(())
    } else {
        Err(DeviceError::ProcessFailed {
            tool: tool.to_string(),
            code: status.code(),
            detail: stderr_tail,
        })
    }
}

struct HackRfTransmission {
    proc: Supervised,
    feeder: Option<JoinHandle<()>>,
}

impl HackRfTransmission {
    fn stop_feeder(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

#[async_trait]
impl Transmission for HackRfTransmission {
    fn id(&self) -> Option<u32> {
        self.proc.id()
    }

    async fn wait(&mut self) -> Result<(), DeviceError> {
        let status = self.proc.wait().await?;
        self.stop_feeder();
        exit_result(self.proc.tool(), status, self.proc.stderr_tail())
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<(), DeviceError> {
        self.stop_feeder();
        self.proc.terminate(grace).await?;
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.proc.is_alive()
    }
}
