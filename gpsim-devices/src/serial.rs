//! Serial speed/bearing controller
//!
//! ASCII, one command per `\n`-terminated line:
//!
//! | line                  | meaning                          |
//! |-----------------------|----------------------------------|
//! | `angle_calib <deg>`   | current heading, before motion   |
//! | `speed_set <km/h>`    | target wheel speed               |
//! | `angle_set <deg>`     | target heading                   |
//! | `speed_stop`          | stop the speed actuator          |
//! | `angle_stop`          | stop the heading actuator        |

use async_trait::async_trait;
use gpsim_core::settings::ControllerSettings;
use gpsim_core::{DeviceError, MotionCommand, MotionController};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

pub fn calibrate_line(bearing_deg: f64) -> String {
    format!("angle_calib {:.2}", bearing_deg)
}

pub fn command_lines(command: &MotionCommand) -> [String; 2] {
    [
        format!("speed_set {:.3}", command.speed_kmh),
        format!("angle_set {:.2}", command.bearing_deg),
    ]
}

pub const HALT_LINES: [&str; 2] = ["speed_stop", "angle_stop"];

type PortWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct SerialController {
    port: String,
    writer: Option<PortWriter>,
}

impl SerialController {
    /// Configure the line discipline and open `settings.port` for writing
    pub async fn open(settings: &ControllerSettings) -> Result<Self, DeviceError> {
        configure_port(&settings.port, settings.baud_rate).await?;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        #[cfg(unix)]
        options.custom_flags(libc::O_NOCTTY);
        let file = options
            .open(&settings.port)
            .await
            .map_err(|source| DeviceError::Serial {
                port: settings.port.clone(),
                source,
            })?;

        info!(port = %settings.port, baud = settings.baud_rate, "Motion controller connected");
        Ok(Self::from_writer(settings.port.clone(), file))
    }

    /// Wrap an already-open byte sink (a pty, a socket, a test buffer)
    pub fn from_writer<W>(port: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            port: port.into(),
            writer: Some(Box::new(writer)),
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), DeviceError> {
        let port = self.port.clone();
        let serial_err = |source: io::Error| DeviceError::Serial {
            port: port.clone(),
            source,
        };
        let writer = self.writer.as_mut().ok_or_else(|| {
            serial_err(io::Error::new(io::ErrorKind::NotConnected, "port closed"))
        })?;
        debug!(port = %self.port, "> {}", line);
        writer.write_all(line.as_bytes()).await.map_err(serial_err)?;
        writer.write_all(b"\n").await.map_err(serial_err)?;
        writer.flush().await.map_err(serial_err)?;
        Ok(())
    }
}

#[async_trait]
impl MotionController for SerialController {
    fn name(&self) -> &str {
        &self.port
    }

    async fn calibrate_heading(&mut self, bearing_deg: f64) -> Result<(), DeviceError> {
        self.write_line(&calibrate_line(bearing_deg)).await
    }

    async fn send(&mut self, command: MotionCommand) -> Result<(), DeviceError> {
        for line in command_lines(&command) {
            self.write_line(&line).await?;
        }
        Ok(())
    }

    async fn halt(&mut self) -> Result<(), DeviceError> {
        for line in HALT_LINES {
            self.write_line(line).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        if self.writer.is_none() {
            return Ok(());
        }
        let halted = self.halt().await;
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                warn!(port = %self.port, "Error closing port: {}", e);
            }
        }
        info!(port = %self.port, "Motion controller closed");
        halted
    }
}

/// Set baud rate and raw mode; a port left at the wrong speed garbles every command
#[cfg(unix)]
async fn configure_port(port: &str, baud_rate: u32) -> Result<(), DeviceError> {
    let serial_err = |source: io::Error| DeviceError::Serial {
        port: port.to_string(),
        source,
    };
    let flag = if cfg!(target_os = "macos") { "-f" } else { "-F" };
    let output = tokio::process::Command::new("stty")
        .arg(flag)
        .arg(port)
        .arg(baud_rate.to_string())
        .args(["raw", "-echo"])
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(serial_err)?;
    if !output.status.success() {
        let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(serial_err(io::Error::other(format!(
            "stty could not set {} baud ({}): {}",
            baud_rate, output.status, detail
        ))));
    }
    debug!(port, baud_rate, "Port configured");
    Ok(())
}

#[cfg(not(unix))]
async fn configure_port(_port: &str, _baud_rate: u32) -> Result<(), DeviceError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format() {
        assert_eq!(calibrate_line(90.0), "angle_calib 90.00");
        let [speed, angle] = command_lines(&MotionCommand {
            speed_kmh: 36.12345,
            bearing_deg: 271.456,
        });
        assert_eq!(speed, "speed_set 36.123");
        assert_eq!(angle, "angle_set 271.46");
    }

    #[tokio::test]
    async fn test_writes_protocol_lines() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut ctl = SerialController::from_writer("test", client);
        ctl.calibrate_heading(12.5).await.unwrap();
        ctl.send(MotionCommand { speed_kmh: 10.0, bearing_deg: 45.0 })
            .await
            .unwrap();
        ctl.close().await.unwrap();

        let mut received = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut received)
            .await
            .unwrap();
        assert_eq!(
            received,
            "angle_calib 12.50\nspeed_set 10.000\nangle_set 45.00\nspeed_stop\nangle_stop\n"
        );
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (client, _server) = tokio::io::duplex(64);
        let mut ctl = SerialController::from_writer("test", client);
        ctl.close().await.unwrap();
        let err = ctl.halt().await.unwrap_err();
        assert!(matches!(err, DeviceError::Serial { .. }));
    }

    #[tokio::test]
    async fn test_open_missing_port() {
        let settings = ControllerSettings {
            port: "/nonexistent/ttyGPSIM".to_string(),
            ..Default::default()
        };
        let err = SerialController::open(&settings).await.err().expect("open should fail");
        assert!(matches!(err, DeviceError::Serial { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_fails_when_baud_cannot_be_set() {
        // a plain file opens fine but is not a terminal
        let file = tempfile::NamedTempFile::new().unwrap();
        let settings = ControllerSettings {
            port: file.path().display().to_string(),
            ..Default::default()
        };
        let err = SerialController::open(&settings).await.err().expect("open should fail");
        match err {
            DeviceError::Serial { port, .. } => assert_eq!(port, settings.port),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
