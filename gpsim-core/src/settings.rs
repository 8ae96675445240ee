//! Operator-editable hardware settings
//!
//! Persisted by the server as YAML and exposed over `GET/PUT /settings`.
//! Every field has a default so partial documents are accepted.

use crate::error::SimError;
use serde::{Deserialize, Serialize};

pub const MAX_TXVGA_GAIN: u32 = 47;
pub const FEED_INTERVAL_RANGE_MS: std::ops::RangeInclusive<u64> = 50..=1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub iq_generator: IqGeneratorSettings,
    pub gps_transmitter: GpsTransmitterSettings,
    pub controller: ControllerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IqGeneratorSettings {
    /// Bits per I/Q component: 1, 8 or 16
    pub iq_bits: u8,
    pub iq_sample_rate_hz: u32,
}

impl Default for IqGeneratorSettings {
    fn default() -> Self {
        Self {
            iq_bits: 8,
            iq_sample_rate_hz: 2_600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsTransmitterSettings {
    pub center_freq_hz: u64,
    pub sample_rate_hz: u32,
    pub txvga_gain: u32,
    pub amp_enabled: bool,
}

impl Default for GpsTransmitterSettings {
    fn default() -> Self {
        Self {
            center_freq_hz: 1_575_420_000,
            sample_rate_hz: 2_600_000,
            txvga_gain: 40,
            amp_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub port: String,
    pub baud_rate: u32,
    /// Period of speed/bearing commands during playback
    pub feed_interval_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            feed_interval_ms: 250,
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> Result<(), SimError> {
        let iq = &self.iq_generator;
        if ![1, 8, 16].contains(&iq.iq_bits) {
            return Err(SimError::InvalidRequest(format!(
                "iq_bits must be 1, 8, or 16, got {}",
                iq.iq_bits
            )));
        }
        if iq.iq_sample_rate_hz == 0 {
            return Err(SimError::InvalidRequest(
                "iq_sample_rate_hz must be > 0".into(),
            ));
        }

        let tx = &self.gps_transmitter;
        if tx.center_freq_hz == 0 || tx.sample_rate_hz == 0 {
            return Err(SimError::InvalidRequest(
                "center_freq_hz and sample_rate_hz must be > 0".into(),
            ));
        }
        if tx.sample_rate_hz != iq.iq_sample_rate_hz {
            return Err(SimError::InvalidRequest(format!(
                "transmitter sample_rate_hz {} must match iq_sample_rate_hz {}",
                tx.sample_rate_hz, iq.iq_sample_rate_hz
            )));
        }
        if tx.txvga_gain > MAX_TXVGA_GAIN {
            return Err(SimError::InvalidRequest(format!(
                "txvga_gain must be within 0..={}, got {}",
                MAX_TXVGA_GAIN, tx.txvga_gain
            )));
        }

        let ctl = &self.controller;
        if ctl.port.trim().is_empty() {
            return Err(SimError::InvalidRequest("controller port must not be empty".into()));
        }
        if ctl.baud_rate == 0 {
            return Err(SimError::InvalidRequest("baud_rate must be > 0".into()));
        }
        if !FEED_INTERVAL_RANGE_MS.contains(&ctl.feed_interval_ms) {
            return Err(SimError::InvalidRequest(format!(
                "feed_interval_ms must be within {}..={}, got {}",
                FEED_INTERVAL_RANGE_MS.start(),
                FEED_INTERVAL_RANGE_MS.end(),
                ctl.feed_interval_ms
            )));
        }
        Ok(())
    }
}
