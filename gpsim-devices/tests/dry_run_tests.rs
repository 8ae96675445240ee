//! Integration tests for the dry-run device factory

use gpsim_core::settings::{AppSettings, ControllerSettings};
use gpsim_core::{DeviceError, DeviceFactory, IqSource, MotionCommand};
use gpsim_devices::{ControllerEvent, DryRunDevices, TransmitterBehavior};
use std::path::PathBuf;
use std::time::Duration;

fn source(duration_s: f64) -> IqSource {
    IqSource {
        path: PathBuf::from("route.iq"),
        offset_bytes: 2_600,
        length_bytes: Some(5_200),
        duration_s,
    }
}

#[test]
fn test_dry_run_names() {
    let devices = DryRunDevices::new();
    let settings = AppSettings::default();
    assert_eq!(devices.transmitter(&settings).name(), "dry-run");
    assert_eq!(devices.iq_generator(&settings).name(), "null");
}

#[tokio::test]
async fn test_controller_records_events_in_order() {
    let devices = DryRunDevices::new();
    let log = devices.log();
    let mut ctl = devices
        .open_controller(&ControllerSettings::default())
        .await
        .expect("dry-run controller should open");

    ctl.halt().await.unwrap();
    ctl.calibrate_heading(90.0).await.unwrap();
    ctl.send(MotionCommand { speed_kmh: 12.0, bearing_deg: 91.0 })
        .await
        .unwrap();
    ctl.close().await.unwrap();

    assert_eq!(
        log.controller_events(),
        vec![
            ControllerEvent::Halt,
            ControllerEvent::Calibrate(90.0),
            ControllerEvent::Command(MotionCommand { speed_kmh: 12.0, bearing_deg: 91.0 }),
            ControllerEvent::Halt,
            ControllerEvent::Close,
        ]
    );
    assert_eq!(log.commands().len(), 1);
}

#[tokio::test]
async fn test_controller_serial_failure() {
    let devices = DryRunDevices::new().with_serial_failure_on_send(2);
    let mut ctl = devices
        .open_controller(&ControllerSettings::default())
        .await
        .unwrap();
    let cmd = MotionCommand { speed_kmh: 1.0, bearing_deg: 0.0 };
    assert!(ctl.send(cmd).await.is_ok());
    let err = ctl.send(cmd).await.unwrap_err();
    assert!(matches!(err, DeviceError::Serial { .. }));
}

#[tokio::test]
async fn test_transmission_runs_until_shutdown() {
    let devices = DryRunDevices::new();
    let log = devices.log();
    let tx = devices.transmitter(&AppSettings::default());

    let mut transmission = tx.start(source(1.0)).await.unwrap();
    assert!(transmission.is_alive());
    assert_eq!(log.alive_transmissions(), 1);
    assert_eq!(log.transmissions()[0].offset_bytes, 2_600);

    let waited = tokio::time::timeout(Duration::from_millis(50), transmission.wait()).await;
    assert!(waited.is_err(), "wait() should not finish on its own");

    transmission.shutdown(Duration::from_millis(10)).await.unwrap();
    assert!(!transmission.is_alive());
    assert_eq!(log.alive_transmissions(), 0);
}

#[tokio::test]
async fn test_transmission_play_to_end() {
    let devices = DryRunDevices::new().with_transmitter(TransmitterBehavior::PlayToEnd);
    let log = devices.log();
    let tx = devices.transmitter(&AppSettings::default());

    let mut transmission = tx.start(source(0.05)).await.unwrap();
    transmission.wait().await.expect("clean exit");
    assert!(!transmission.is_alive());
    assert_eq!(log.alive_transmissions(), 0);
}

#[tokio::test]
async fn test_transmission_busy() {
    let devices = DryRunDevices::new().with_transmitter(TransmitterBehavior::Busy);
    let tx = devices.transmitter(&AppSettings::default());
    let mut transmission = tx.start(source(1.0)).await.unwrap();
    let err = transmission.wait().await.unwrap_err();
    assert!(matches!(err, DeviceError::Busy(_)));
    assert!(!transmission.is_alive());
}

#[tokio::test]
async fn test_dropped_transmission_is_not_counted() {
    let devices = DryRunDevices::new();
    let log = devices.log();
    let tx = devices.transmitter(&AppSettings::default());
    let transmission = tx.start(source(1.0)).await.unwrap();
    assert_eq!(log.alive_transmissions(), 1);
    drop(transmission);
    assert_eq!(log.alive_transmissions(), 0);
}
